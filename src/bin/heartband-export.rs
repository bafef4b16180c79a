use chrono::Utc;
use clap::Parser;
use heartband_relay::export::{self, ExportOptions};
use heartband_relay::logging;
use tracing::error;

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

fn main() {
    let options = ExportOptions::parse();

    if let Err(why) = logging::init(false) {
        eprintln!("error: invalid log filter: {}", why);
        std::process::exit(EXIT_ERROR);
    }

    match export::run(&options, Utc::now()) {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
