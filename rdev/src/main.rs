use anyhow::{bail, Context};
use clap::ArgAction;
use rdev_transport::options::parse_number;
use rdev_transport::rdev::RdevTransport;
use rdev_transport::Transport;

fn args() -> clap::Command {
    clap::command!()
        .subcommand_required(true)
        .arg(
            clap::Arg::new("server")
                .short('s')
                .long("server")
                .action(ArgAction::Set)
                .help("The rdevd to connect to")
                .default_value("localhost:3930"),
        )
        .subcommand(
            clap::Command::new("info")
                .about("Open a device and show what it is")
                .arg(clap::Arg::new("device").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            clap::Command::new("read")
                .about("Read once from a device")
                .arg(clap::Arg::new("device").required(true).action(ArgAction::Set))
                .arg(clap::Arg::new("control").required(true).action(ArgAction::Set))
                .arg(
                    clap::Arg::new("length")
                        .short('n')
                        .long("length")
                        .action(ArgAction::Set)
                        .value_parser(clap::value_parser!(u16))
                        .default_value("16"),
                ),
        )
        .subcommand(
            clap::Command::new("write")
                .about("Write a hex encoded payload to a device")
                .arg(clap::Arg::new("device").required(true).action(ArgAction::Set))
                .arg(clap::Arg::new("control").required(true).action(ArgAction::Set))
                .arg(clap::Arg::new("payload").required(true).action(ArgAction::Set)),
        )
}

fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: Vec<char> = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {s:?}");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).with_context(|| format!("invalid hex byte {byte:?}"))
        })
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn open(server: &str, device: &str) -> anyhow::Result<RdevTransport> {
    let transport = RdevTransport::new(server, device)?;
    transport
        .open()
        .with_context(|| format!("could not open {device} on {server}"))?;
    Ok(transport)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = args().get_matches();
    let server = matches
        .get_one::<String>("server")
        .context("no server given")?;

    match matches.subcommand() {
        Some(("info", sub)) => {
            let device = sub.get_one::<String>("device").context("no device given")?;
            let transport = open(server, device)?;
            println!(
                "{device}: unit {} ({})",
                transport.unit().unwrap_or_default(),
                transport.remote_kind().unwrap_or_default()
            );
            transport.close()?;
        }
        Some(("read", sub)) => {
            let device = sub.get_one::<String>("device").context("no device given")?;
            let control = parse_number(sub.get_one::<String>("control").context("no control given")?)?;
            let length = *sub.get_one::<u16>("length").context("no length given")?;

            let transport = open(server, device)?;
            let mut buf = vec![0u8; length as usize];
            let n = transport.read(control, &mut buf)?;
            log::debug!("read {n} bytes from {device}");
            println!("{}", to_hex(&buf[..n]));
            transport.close()?;
        }
        Some(("write", sub)) => {
            let device = sub.get_one::<String>("device").context("no device given")?;
            let control = parse_number(sub.get_one::<String>("control").context("no control given")?)?;
            let payload = parse_hex(sub.get_one::<String>("payload").context("no payload given")?)?;

            let transport = open(server, device)?;
            let n = transport.write(control, &payload)?;
            log::debug!("wrote {n} bytes to {device}");
            transport.close()?;
        }
        _ => unreachable!(),
    }

    Ok(())
}
