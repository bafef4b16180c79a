use clap::Parser;
use heartband_relay::app::{self, Options, RealScanner};
use heartband_relay::logging;
use heartband_relay::shutdown::{Shutdown, listen_for_signals};
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Process managers watching the exit status need a distinct code for panics
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    if let Err(why) = logging::init(options.verbose) {
        eprintln!("error: invalid log filter: {}", why);
        std::process::exit(EXIT_ERROR);
    }

    info!("Xiaomi Smart Band heart rate relay");
    info!("Press Ctrl+C to stop");

    let shutdown = Shutdown::new();
    if let Err(why) = listen_for_signals(shutdown.clone()) {
        error!("failed to install signal handlers: {}", why);
        std::process::exit(EXIT_ERROR);
    }

    match app::run(&options, &RealScanner, &shutdown).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
