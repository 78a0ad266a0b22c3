use cardsync::ui::io;
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    match io::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
