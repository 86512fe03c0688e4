use std::time::Duration;

use clap::{ArgAction, Command, arg};
use log::LevelFilter;
use serde_json::json;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use usbrelay::state::ChannelStates;
use usbrelay::usb_device;

fn cli() -> Command {
    Command::new("usbrelay")
        .about("USB HID relay board utility")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(
            arg!(-v --verbose "Increase log verbosity")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            arg!(--channels <channels> "Channels to operate on (comma-separated)")
                .action(ArgAction::Append)
                .value_delimiter(',')
                .value_parser(|s: &str| {
                    let val: u8 = s.parse().map_err(|_| "Not a valid number")?;
                    if usbrelay::ALL_CHANNELS.contains(&val) {
                        Ok(val)
                    } else {
                        Err(format!(
                            "Channel must be in range {:?}",
                            usbrelay::ALL_CHANNELS
                        ))
                    }
                })
                .global(true),
        )
        .subcommand(Command::new("discover").about("List connected relay boards"))
        .subcommand(Command::new("on").about("Turn channel on"))
        .subcommand(Command::new("off").about("Turn channel off"))
        .subcommand(
            Command::new("pulse")
                .about("Momentary on-then-off contact closure")
                .arg(
                    arg!(--settle <settle> "Delay after the normalizing off")
                        .value_parser(clap::builder::ValueParser::from(humantime::parse_duration))
                        .default_value("100ms"),
                )
                .arg(
                    arg!(--hold <hold> "How long the channel is held on")
                        .value_parser(clap::builder::ValueParser::from(humantime::parse_duration))
                        .default_value("1s"),
                ),
        )
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("logger already initialized");
}

fn open_relay() -> anyhow::Result<usb_device::Device> {
    match usb_device::open() {
        Ok(dev) => Ok(dev),
        Err(usb_device::RelayError::DeviceNotFound) => {
            anyhow::bail!("USB relay was not found")
        }
        Err(e) => anyhow::bail!("unable to open device: {e}"),
    }
}

fn channels_arg(matches: &clap::ArgMatches, dev: &usb_device::Device) -> Vec<u8> {
    match matches.get_many::<u8>("channels") {
        Some(channels) => channels.copied().collect(),
        None => (1..=dev.relays()).collect(),
    }
}

fn run() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_count("verbose"));

    let states = ChannelStates::new();

    match matches.subcommand() {
        Some(("discover", _sub_matches)) => {
            let devices = match usb_device::list() {
                Ok(devices) => devices,
                Err(e) => anyhow::bail!("unable to list devices: {e}"),
            };

            let out = json!(devices.collect::<Vec<_>>());
            println!("{}", out);
        }
        Some((cmd @ ("on" | "off"), _sub_matches)) => {
            let on = cmd == "on";

            let dev = open_relay()?;
            let out = json!(
                channels_arg(&matches, &dev)
                    .iter()
                    .map(|&channel| {
                        match dev.send_command(channel, on) {
                            Ok(_) => {
                                states.set(channel, on);
                                json!({
                                    "channel": channel,
                                    "on": states.get(channel),
                                })
                            }
                            Err(e) => json!({
                                "channel": channel,
                                "err": e.to_string(),
                            }),
                        }
                    })
                    .collect::<Vec<_>>()
            );
            println!("{}", out);
        }
        Some(("pulse", pulse_matches)) => {
            let settle = pulse_matches
                .get_one::<Duration>("settle")
                .expect("defaulted arg");
            let hold = pulse_matches
                .get_one::<Duration>("hold")
                .expect("defaulted arg");

            let dev = open_relay()?;
            let out = json!(
                channels_arg(&matches, &dev)
                    .iter()
                    .map(|&channel| {
                        match dev.pulse(channel, *settle, *hold) {
                            Ok(_) => {
                                // A completed pulse leaves the channel low;
                                // propagate that to anyone tracking it.
                                states.set(channel, false);
                                json!({
                                    "channel": channel,
                                    "pulsed": true,
                                    "on": states.get(channel),
                                })
                            }
                            Err(e) => json!({
                                "channel": channel,
                                "err": e.to_string(),
                            }),
                        }
                    })
                    .collect::<Vec<_>>()
            );
            println!("{}", out);
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    std::process::exit(0);
}
