use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use stonefs::log::inspect::verify_log_file;
use stonefs::service::setup_local_tracing;
use stonefs::AppResult;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute and check every block checksum and the file digest.
    Verify {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print the block layout and record lines of a log file.
    Dump {
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> AppResult<()> {
    setup_local_tracing()?;

    let cli = Cli::parse();

    match &cli.command {
        Commands::Verify { file } => verify(file),
        Commands::Dump { file } => dump(file),
    }
}

fn verify(file: &PathBuf) -> AppResult<()> {
    let summary = verify_log_file(file)?;
    for block in &summary.blocks {
        println!(
            "block {}: committed {}, last record {}, {} record line(s)",
            block.block_seq, block.committed_seq, block.last_record_seq, block.record_lines
        );
    }
    println!("blocks: {}", summary.blocks.len());
    println!("closed: {}", summary.closed);
    if summary.trailing_records > 0 {
        println!("torn tail: {} record line(s)", summary.trailing_records);
    }
    if let Some(digest) = &summary.trailer_digest {
        println!("digest: {} (verified)", digest);
    }
    println!("ok");
    Ok(())
}

fn dump(file: &PathBuf) -> AppResult<()> {
    // Checksums first; dumping a corrupt file would mislead.
    let summary = verify_log_file(file)?;

    let reader = BufReader::new(File::open(file)?);
    let mut block = 0usize;
    let mut previous_was_commit = false;
    for line in reader.lines() {
        let line = line?;
        if previous_was_commit {
            previous_was_commit = false;
            let seq = summary
                .blocks
                .get(block)
                .map(|info| info.block_seq)
                .unwrap_or(-1);
            println!("--- end of block {} ({})", seq, line);
            block += 1;
            continue;
        }
        if line.starts_with("c/") {
            println!("--- commit marker: {}", line);
            previous_was_commit = true;
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}
