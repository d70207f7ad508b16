// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto
mod spidev;

use {
    clap::Parser,
    glib::{Error, FileError},
    most_protocols::{
        mbo::{Mbo, MboStatus},
        spi::{channel::CH_CTRL_RX, dci::DciAttribute, *},
        ChannelConfig, ChannelDataType, ChannelDirection, InterfaceId,
    },
    nix::sys::signal,
    runtime_core::{cmdline::*, dispatcher::*, LogLevel, *},
    spidev::SpiDev,
    std::{
        sync::{mpsc, Arc, Mutex, Weak},
        time::Duration,
    },
    tracing::{debug, debug_span, info, Level},
};

enum Event {
    Shutdown,
    NetInfo(NetInfo),
    CtrlMessage(Mbo),
}

// The buffer object is queued again instead of being lost when the event queue is full.
fn forward_ctrl_message<F>(tx: &mpsc::SyncSender<Event>, mbo: Mbo, requeue: F)
where
    F: FnOnce(Mbo),
{
    match tx.try_send(Event::CtrlMessage(mbo)) {
        Err(mpsc::TrySendError::Full(Event::CtrlMessage(mbo))) => {
            debug!(len = mbo.processed_length(), "event queue is full, message discarded");
            requeue(mbo);
        }
        Err(mpsc::TrySendError::Disconnected(Event::CtrlMessage(mbo))) => mbo.put(),
        _ => (),
    }
}

fn requeue_ctrl_buffer(dev: &HdmDevice, mut mbo: Mbo) -> Result<(), Error> {
    mbo.set_processed_length(0)?;
    dev.enqueue(CH_CTRL_RX, mbo)
}

/// The operation for attribute of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrOp {
    attr: DciAttribute,
    value: Option<String>,
}

impl std::str::FromStr for AttrOp {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (name, value) = match text.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (text, None),
        };
        DciAttribute::from_name(name)
            .map(|attr| AttrOp { attr, value })
            .ok_or_else(|| {
                let names: Vec<&str> = DciAttribute::ALL.iter().map(|attr| attr.name()).collect();
                format!("Unknown attribute {}, one of {}", name, names.join(", "))
            })
    }
}

struct Params {
    path: String,
    mode: u8,
    speed_hz: u32,
    poll_interval: Duration,
    attrs: Vec<AttrOp>,
}

struct MostSpiRuntime {
    dev: Arc<HdmDevice>,
    worker: Option<InterruptWorker>,
    poll_interval: Duration,
    attrs: Vec<AttrOp>,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
}

impl Drop for MostSpiRuntime {
    fn drop(&mut self) {
        // At first, stop event loop in all of dispatchers to avoid queueing new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }

        // Next, consume all events in queue to release blocked thread for sender.
        for _ in self.rx.try_iter() {}

        // Finally Finish I/O threads.
        self.dispatchers.clear();

        let _ = self.dev.poison_channel(CH_CTRL_RX);
        let _ = self.dev.remove();
        self.worker = None;
    }
}

impl RuntimeOperation<Params> for MostSpiRuntime {
    fn new(params: Params, log_level: Option<LogLevel>) -> Result<Self, Error> {
        if let Some(level) = log_level {
            let fmt_level = match level {
                LogLevel::Info => Level::INFO,
                LogLevel::Debug => Level::DEBUG,
            };
            tracing_subscriber::fmt().with_max_level(fmt_level).init();
        }

        if params.poll_interval.is_zero() {
            Err(Error::new(FileError::Inval, "Poll interval should not be zero"))?;
        }

        let transport = SpiDev::open(&params.path, params.mode, params.speed_hz)?;
        let dev = HdmDevice::probe(Box::new(transport))?;

        // Use uni-directional channel for communication to child threads.
        let (tx, rx) = mpsc::sync_channel(32);

        Ok(MostSpiRuntime {
            dev,
            worker: None,
            poll_interval: params.poll_interval,
            attrs: params.attrs,
            rx,
            tx,
            dispatchers: Default::default(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        let worker = InterruptWorker::spawn(&self.dev);
        let trigger = worker.trigger();
        self.worker = Some(worker);

        self.launch_system_event_dispatcher()?;
        self.launch_interrupt_poller(trigger)?;

        if self.attrs.is_empty() {
            let tx = Mutex::new(self.tx.clone());
            self.dev.request_netinfo(Some(Box::new(move |info| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.try_send(Event::NetInfo(*info));
                }
            })))?;

            self.start_ctrl_monitor()?;
        }

        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        if !self.attrs.is_empty() {
            let _enter = debug_span!("attribute").entered();
            return self.attrs.iter().try_for_each(|op| match &op.value {
                Some(value) => {
                    debug!(name = op.attr.name(), value = value.as_str(), "store");
                    self.dev.attribute_store(op.attr, value)
                }
                None => self.dev.attribute_show(op.attr).map(|text| {
                    print!("{}: {}", op.attr.name(), text);
                }),
            });
        }

        let enter = debug_span!("event").entered();
        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => continue,
            };

            match ev {
                Event::Shutdown => break,
                Event::NetInfo(info) => {
                    let _enter = debug_span!("netinfo").entered();
                    info!(
                        link_up = info.link_up,
                        mac = format!(
                            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                            info.mac[0],
                            info.mac[1],
                            info.mac[2],
                            info.mac[3],
                            info.mac[4],
                            info.mac[5]
                        )
                        .as_str(),
                        "network information",
                    );
                }
                Event::CtrlMessage(mbo) => {
                    let _enter = debug_span!("control").entered();
                    let status = mbo.status();
                    if status == MboStatus::Success {
                        debug!(len = mbo.processed_length(), payload = ?mbo.payload());
                    }
                    match requeue_ctrl_buffer(&self.dev, mbo) {
                        Err(err) if status == MboStatus::Success => Err(err)?,
                        Err(err) => debug!(?status, ?err, "buffer object is not queued again"),
                        Ok(()) => (),
                    }
                }
            }
        }

        enter.exit();

        Ok(())
    }
}

impl MostSpiRuntime {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const POLL_DISPATCHER_NAME: &'static str = "interrupt poll dispatcher";

    const CTRL_BUFFER_COUNT: usize = 4;
    const CTRL_BUFFER_SIZE: usize = 64;
    const IFACE_ID: InterfaceId = InterfaceId(0);

    // The received messages are reported then the buffer objects are queued again.
    fn start_ctrl_monitor(&mut self) -> Result<(), Error> {
        let cfg = ChannelConfig {
            direction: ChannelDirection::Rx,
            data_type: ChannelDataType::Control,
            num_buffers: Self::CTRL_BUFFER_COUNT,
            buffer_size: Self::CTRL_BUFFER_SIZE,
            ..Default::default()
        };

        let tx = Mutex::new(self.tx.clone());
        let dev: Weak<HdmDevice> = Arc::downgrade(&self.dev);
        self.dev.configure_channel(
            CH_CTRL_RX,
            &cfg,
            Arc::new(move |mbo| {
                let requeue = |mbo| match dev.upgrade() {
                    Some(dev) => {
                        if let Err(err) = requeue_ctrl_buffer(&dev, mbo) {
                            debug!(?err, "buffer object is not queued again");
                        }
                    }
                    None => debug!("device is already released"),
                };
                match tx.lock() {
                    Ok(tx) => forward_ctrl_message(&tx, mbo, requeue),
                    Err(_) => requeue(mbo),
                }
            }),
        )?;

        (0..Self::CTRL_BUFFER_COUNT).try_for_each(|_| {
            let mbo = Mbo::new(Self::IFACE_ID, CH_CTRL_RX, Self::CTRL_BUFFER_SIZE);
            self.dev.enqueue(CH_CTRL_RX, mbo)
        })
    }

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::SYSTEM_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        [signal::Signal::SIGINT, signal::Signal::SIGTERM]
            .iter()
            .for_each(|&signum| {
                let tx = self.tx.clone();
                dispatcher.attach_signal_handler(signum, move || {
                    let _ = tx.send(Event::Shutdown);
                    glib::ControlFlow::Break
                });
            });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    // The interrupt line of controller is not available via spidev, thus the status is polled.
    fn launch_interrupt_poller(&mut self, trigger: InterruptTrigger) -> Result<(), Error> {
        let name = Self::POLL_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        dispatcher.attach_interval_handler(self.poll_interval, move || {
            trigger.raise();
            glib::ControlFlow::Continue
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }
}

struct MostSpiServiceCmd;

#[derive(Parser, Default)]
#[clap(name = "most-spi-ctl-service")]
struct Arguments {
    /// The path to character device of spidev connected to the controller.
    path: String,

    /// The mode of SPI bus.
    #[clap(long, default_value_t = 0)]
    mode: u8,

    /// The maximum speed of SPI bus in Hz.
    #[clap(long, default_value_t = 10_000_000)]
    speed_hz: u32,

    /// The interval to poll interrupt status in milliseconds.
    #[clap(long, default_value_t = 10)]
    poll_interval: u64,

    /// Show the attribute of controller, or store the value when given as NAME=VALUE. The
    /// runtime exits after the operations.
    #[clap(long)]
    attr: Vec<AttrOp>,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, Params, MostSpiRuntime> for MostSpiServiceCmd {
    fn params(args: &Arguments) -> (Params, Option<LogLevel>) {
        let params = Params {
            path: args.path.clone(),
            mode: args.mode,
            speed_hz: args.speed_hz,
            poll_interval: Duration::from_millis(args.poll_interval),
            attrs: args.attr.clone(),
        };
        (params, args.log_level)
    }
}

fn main() {
    MostSpiServiceCmd::run()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attribute_operation() {
        assert_eq!(
            "packet_hash=0001 0002 0003 0004".parse::<AttrOp>(),
            Ok(AttrOp {
                attr: DciAttribute::PacketHash,
                value: Some("0001 0002 0003 0004".to_string()),
            })
        );
        assert_eq!(
            "node_address".parse::<AttrOp>(),
            Ok(AttrOp {
                attr: DciAttribute::NodeAddress,
                value: None,
            })
        );
        assert!("node_addr".parse::<AttrOp>().is_err());
    }

    #[test]
    fn ctrl_message_forwarding() {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut requeued = Vec::new();

        let mbo = Mbo::new(InterfaceId(0), CH_CTRL_RX, 64);
        forward_ctrl_message(&tx, mbo, |mbo| requeued.push(mbo));
        assert!(requeued.is_empty());

        // The buffer object goes back to the channel when the queue is full.
        let mbo = Mbo::new(InterfaceId(0), CH_CTRL_RX, 64);
        forward_ctrl_message(&tx, mbo, |mbo| requeued.push(mbo));
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].channel_id(), CH_CTRL_RX);

        assert!(matches!(rx.try_recv(), Ok(Event::CtrlMessage(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn arguments() {
        let args = Arguments::try_parse_from([
            "most-spi-ctl-service",
            "/dev/spidev0.0",
            "--attr",
            "packet_bw",
            "--attr",
            "packet_filter_mode=0x1",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let (params, log_level) = MostSpiServiceCmd::params(&args);
        assert_eq!(params.path, "/dev/spidev0.0");
        assert_eq!(params.speed_hz, 10_000_000);
        assert_eq!(params.poll_interval, Duration::from_millis(10));
        assert_eq!(params.attrs.len(), 2);
        assert_eq!(log_level, Some(LogLevel::Debug));
    }
}
