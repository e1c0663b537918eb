use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    process,
    str::FromStr,
    time::Duration,
};

use log::{info, warn};
use tokio::{runtime::Runtime, signal};

mod checksum;
mod device;
mod forward;
mod ip;
mod logger;
mod nat;

enum Action {
    Serve(ServeConfig),
}

struct ServeConfig {
    device_socket: PathBuf,
    device_peer: Option<PathBuf>,
    nat: nat::Config,
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: portalnat [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --device-socket=<PATH>           Unix datagram socket exchanging IP packets with the device\
\n      --device-peer=<PATH>             Device peer socket to connect to [default: first sender]\
\n      --gateway=<IPv4>                 Gateway address, used as the redirected destination [default: 198.18.0.1]\
\n      --portal=<IPv4>                  Portal address, used as the redirected source [default: 198.18.0.2]\
\n      --listen-ip=<IP>                 Listen IP address for redirected connections [default: 0.0.0.0]\
\n      --checksum=<compat|wide>         Checksum implementation [default: compat]\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut device_socket = None;
        let mut device_peer = None;
        let mut gateway = Ipv4Addr::new(198, 18, 0, 1);
        let mut portal = Ipv4Addr::new(198, 18, 0, 2);
        let mut listen_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut checksummer = checksum::Checksummer::default();

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--device-socket" {
                device_socket = Some(PathBuf::from(value));
            } else if name == "--device-peer" {
                device_peer = Some(PathBuf::from(value));
            } else if name == "--gateway" || name == "--portal" {
                match Ipv4Addr::from_str(value) {
                    Ok(addr) if name == "--gateway" => gateway = addr,
                    Ok(addr) => portal = addr,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 address: {}", err),
                    ),
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => listen_ip = ip,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--checksum" {
                checksummer = match value.to_lowercase().as_str() {
                    "compat" => checksum::Checksummer::new(checksum::sum_compat),
                    "wide" => checksum::Checksummer::new(checksum::sum_wide),
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported checksum"));
                        process::exit(2);
                    }
                };
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                let device_socket = if let Some(device_socket) = device_socket {
                    device_socket
                } else {
                    eprintln!("No device socket specified");
                    println!("{}", USAGE_INSTRUCTIONS);
                    process::exit(2);
                };
                if gateway == portal {
                    eprintln!("Gateway and portal addresses must be different");
                    process::exit(2);
                }

                let action = Action::Serve(ServeConfig {
                    device_socket,
                    device_peer,
                    nat: nat::Config {
                        gateway: IpAddr::V4(gateway),
                        portal: IpAddr::V4(portal),
                        listen_ip,
                        checksummer,
                    },
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

async fn run_serve(config: ServeConfig) -> Result<(), forward::ForwardError> {
    let device =
        device::UnixDatagramDevice::bind(&config.device_socket, config.device_peer.as_deref())?;
    let engine = nat::start(device, config.nat).await?;
    let forwarder = forward::Forwarder::new(&engine);
    let forwarder = tokio::spawn(async move { forwarder.run().await });

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received Ctrl+C, shutting down");
        }
        _ = engine.tcp().closed() => {
            warn!("NAT engine stopped");
        }
    }
    engine.close();
    let result = engine.wait().await;
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Forwarder failed: {}", err),
        Err(err) => warn!("Forwarder task failed: {}", err),
    }
    Ok(result?)
}

fn serve(config: ServeConfig) -> Result<(), forward::ForwardError> {
    let rt = Runtime::new()?;
    rt.block_on(run_serve(config))?;
    rt.shutdown_timeout(Duration::from_secs(60));

    info!("Stopped server");
    Ok(())
}

fn main() {
    println!(
        "Portalnat version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config) => {
            if let Err(err) = serve(config) {
                println!("Failed to run server, error is {}", err);
                process::exit(1);
            }
        }
    }
}
