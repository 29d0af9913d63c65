use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match cryptforge::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error:?}");
            ExitCode::from(cryptforge::error::exit_code_of(&error))
        }
    }
}
