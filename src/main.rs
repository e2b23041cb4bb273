use std::io;

use gumdrop::Options;

use age_plugin_piv::card::PivOpener;
use age_plugin_piv::error::Error;
use age_plugin_piv::stanza::{Conn, IgnoreBrokenPipe};
use age_plugin_piv::{identity_plugin, recipient_plugin};

#[derive(Debug, Options)]
struct PluginOptions {
    #[options(help = "Print this help message and exit.")]
    help: bool,

    #[options(
        help = "Run the given age plugin state machine. Internal use only.",
        meta = "STATE-MACHINE",
        no_short
    )]
    age_plugin: Option<String>,
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let opts = PluginOptions::parse_args_default_or_exit();
    let state_machine = opts.age_plugin.ok_or(Error::MalformedCommandLine)?;

    let stdin = io::stdin();
    let stdout = IgnoreBrokenPipe::new(io::stdout());
    let mut conn = Conn::new(stdin, stdout);

    match state_machine.as_str() {
        "identity-v1" => identity_plugin::run(&PivOpener, &mut conn),
        "recipient-v1" => recipient_plugin::run(&mut conn),
        other => Err(Error::UnknownStateMachine(other.to_string())),
    }
}
