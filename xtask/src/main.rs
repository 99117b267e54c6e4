use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for pointstream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run fmt, clippy, tests and doc in sequence
    Check,
    /// Run cargo fmt --check on all crates
    Fmt,
    /// Run clippy on all crates and targets, warnings denied
    Clippy,
    /// Run all tests, optionally only those matching a filter
    Test {
        /// Test name filter passed through to cargo test
        filter: Option<String>,
    },
    /// Run the stream scheduler bench
    Bench,
    /// Build rustdoc for the workspace
    Doc,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            fmt()?;
            clippy()?;
            test(None)?;
            doc()?;
        }
        Commands::Fmt => fmt()?,
        Commands::Clippy => clippy()?,
        Commands::Test { filter } => test(filter.as_deref())?,
        Commands::Bench => bench()?,
        Commands::Doc => doc()?,
    }

    Ok(())
}

fn cargo(step: &str, args: &[&str]) -> Result<()> {
    println!("==> cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{step} failed");
    }
    Ok(())
}

fn fmt() -> Result<()> {
    cargo("fmt check", &["fmt", "--all", "--", "--check"])
}

fn clippy() -> Result<()> {
    cargo(
        "clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )
}

fn test(filter: Option<&str>) -> Result<()> {
    let mut args = vec!["test", "--workspace"];
    if let Some(filter) = filter {
        args.push(filter);
    }
    cargo("tests", &args)
}

fn bench() -> Result<()> {
    cargo(
        "bench",
        &[
            "bench",
            "-p",
            "pointstream-stream",
            "--bench",
            "bench_stream_scheduler",
        ],
    )
}

fn doc() -> Result<()> {
    cargo("doc", &["doc", "--workspace", "--no-deps"])
}
