//! Example echo daemon built on the hearth framework.
//!
//! Usage: `hearthd [config.toml] [stop|quit|reload|reopen]`. With a signal
//! name the running instance named by the pid file is signalled instead of
//! starting a new one.

use hearth::logging;
use hearth::message::PROTO_EXTERNAL;
use hearth::status::Result;
use hearth::task::{Handler, Task};
use hearth::{Config, Master, Server};
use std::env;

struct EchoHandler {
    log: logging::Logger,
    served: u64,
}

impl Handler for EchoHandler {
    fn on_open(&mut self, task: &mut Task) -> Result<()> {
        logging::debug!(self.log, "client connected"; "peer" => task.socket().peer().to_owned());
        task.queue(PROTO_EXTERNAL, b"hello hearth~")
    }

    fn on_message(&mut self, task: &mut Task, proto: u8, payload: &[u8]) -> Result<()> {
        self.served += 1;
        task.queue(proto, payload)
    }

    fn on_exit(&mut self) {
        logging::info!(self.log, "echo worker done"; "served" => self.served);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let config_arg = args.next();
    let signal_arg = args.next();

    let mut config = match &config_arg {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if config.host.is_none() {
        config.host = Some("127.0.0.1".to_owned());
    }
    if config.port.is_none() {
        config.port = Some(10025);
    }

    let log = match &config.log {
        Some(log_config) => logging::build(log_config)?,
        None => logging::init(None)?,
    };

    if let Some(version) = &config.version {
        logging::info!(log, "hearthd starting"; "version" => version.to_owned());
    }
    if config.daemon {
        // Detaching from the terminal is the job of an external helper
        // (systemd, runit, setsid); the flag is only acknowledged here.
        logging::info!(log, "daemon flag set, expecting an external supervisor");
    }

    let handler = EchoHandler { log: log.new(logging::o!("component" => "echo")), served: 0 };
    let server = Server::new(&config, handler, &log)?;
    let mut master = Master::new("hearthd", server, config, &log);

    if let Some(name) = signal_arg {
        return master.signal_process(&name);
    }

    master.prepare_start()?;
    master.master_start()
}

fn main() {
    if let Err(status) = run() {
        eprintln!("hearthd: {}", status);
        std::process::exit(1);
    }
}
