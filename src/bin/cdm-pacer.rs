use std::process;

use cdm_pacer::cli::{self, Cli};
use cdm_pacer::CdmError;
use clap::Parser;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    match cli::execute(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("Caused by: {}", cause);
            }
            if let Some(err) = e.chain().find_map(|cause| cause.downcast_ref::<CdmError>()) {
                for hint in err.suggestions() {
                    eprintln!("Hint: {}", hint);
                }
            }
            process::exit(1);
        }
    }
}
