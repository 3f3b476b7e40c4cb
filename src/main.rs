use std::process::exit;

use failure::Fail;

fn main() {
    if let Err(error) = needlestack::run() {
        eprintln!("needlestack failed: {}", error);
        let mut cause = error.cause();
        while let Some(error) = cause {
            eprintln!("    caused by: {}", error);
            cause = error.cause();
        }
        exit(1);
    }
}
