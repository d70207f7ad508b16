// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2022 Takashi Sakamoto

use {
    super::{LogLevel, RuntimeOperation},
    clap::Parser,
    glib::{Error, FileError},
    most_protocols::MostError,
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        let code = A::try_parse()
            .map_err(|err| err.to_string())
            .map(|args| Self::params(&args))
            .and_then(|(params, log_level)| {
                R::new(params, log_level)
                    .and_then(|mut runtime| {
                        runtime.listen()?;
                        runtime.run()?;
                        Ok(libc::EXIT_SUCCESS)
                    })
                    .map_err(|err| specific_err_to_string(&err))
            })
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Isdir => "Is directory",
                FileError::Noent => "Not exists",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<MostError>() {
        (
            "MOST operation error",
            match error {
                MostError::Busy => "Controller is busy",
                MostError::Again => "Too many requests",
                MostError::Shutdown => "Device is removed",
                MostError::Io => "Transaction failed",
                MostError::NotSupported => "Not supported",
                MostError::Inval | MostError::Range => "Invalid argument",
                _ => "",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_message() {
        let err = Error::new(MostError::Busy, "DCI command timeout");
        assert_eq!(
            specific_err_to_string(&err),
            "MOST operation error: Controller is busy, DCI command timeout"
        );

        let err = Error::new(FileError::Noent, "/dev/spidev0.0");
        assert_eq!(
            specific_err_to_string(&err),
            "Linux file operation error: Not exists, /dev/spidev0.0"
        );
    }
}
