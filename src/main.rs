use clap::Parser;
use ringkv::cli::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays clean on stdout.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let cmd = Command::parse();
    ringkv::cli::execute_command(cmd).await?;

    Ok(())
}
