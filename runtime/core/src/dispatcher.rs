// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2020 Takashi Sakamoto

use {
    super::*,
    glib::{source, ControlFlow, FileError, MainContext, MainLoop, Source},
    nix::sys::signal,
    std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    },
    tracing::{debug, error},
};

pub struct Dispatcher {
    name: String,
    th: Option<thread::JoinHandle<()>>,
    ev_loop: Arc<MainLoop>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ev_loop.quit();

        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                error!(name = self.name.as_str(), "failed to join thread");
            }
        }
    }
}

impl Dispatcher {
    const LAUNCH_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn run(name: String) -> Result<Dispatcher, Error> {
        // Use own context.
        let ctx = MainContext::new();
        let ev_loop = Arc::new(MainLoop::new(Some(&ctx), false));

        // The first dispatch of idle source tells the launch.
        let (tx, rx) = mpsc::sync_channel(1);
        let src = source::idle_source_new(None, source::Priority::DEFAULT, move || {
            let _ = tx.send(());
            ControlFlow::Break
        });
        src.attach(Some(&ctx));

        // launch one thread to dispatch all events.
        let l = ev_loop.clone();
        let th = Some(thread::spawn(move || l.run()));

        let mut dispatcher = Dispatcher { name, th, ev_loop };

        rx.recv_timeout(Self::LAUNCH_TIMEOUT).map_err(|_| {
            dispatcher.stop();
            let msg = format!("{} is not launched", dispatcher.name);
            Error::new(FileError::Failed, &msg)
        })?;

        debug!(name = dispatcher.name.as_str(), "dispatcher launched");

        Ok(dispatcher)
    }

    pub fn stop(&mut self) {
        self.ev_loop.quit();
    }

    fn attach_src_to_ctx(&mut self, src: &Source) {
        let ctx = self.ev_loop.context();
        src.attach(Some(&ctx));
    }

    pub fn attach_signal_handler<F>(&mut self, signum: signal::Signal, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::unix_signal_source_new(signum as i32, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }

    pub fn attach_interval_handler<F>(&mut self, interval_msec: std::time::Duration, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::timeout_source_new(interval_msec, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }
}
