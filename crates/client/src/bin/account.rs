//! `account` — local keystore management.
//!
//! Passphrases and Tendermint-format private key blocks are read from
//! stdin, matching how keys are usually piped between machines.

use std::io::{self, BufRead, Write};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};

use sao_client::default_repo;
use sao_common::keystore;

#[derive(Parser)]
#[command(name = "account", version, about = "sao account management")]
struct Cli {
    /// client repo directory
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// list all sao chain accounts in the local keystore
    List,
    /// create a new local account with the given name
    Create(KeyNameArgs),
    /// import an exported private key block
    Import(KeyNameArgs),
    /// export the given local account's encrypted private key
    Export(KeyNameArgs),
}

#[derive(Args)]
struct KeyNameArgs {
    /// account name
    #[arg(long = "key-name")]
    key_name: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let keystore_dir = default_repo(cli.repo.as_deref()).join("keystore");
    match cli.command {
        Command::List => {
            for account in keystore::list(&keystore_dir)? {
                println!("Account: {}", account.name);
                println!("Address: {}", account.address);
                println!();
            }
            Ok(())
        }
        Command::Create(args) => {
            let name = resolve_name(args.key_name)?;
            let account = keystore::create(&keystore_dir, &name)?;
            println!("Account: {}", account.name);
            println!("Address: {}", account.address);
            Ok(())
        }
        Command::Import(args) => {
            let name = resolve_name(args.key_name)?;
            println!("Enter secret:");
            let block = read_key_block()?;
            let passphrase = prompt("Enter passphrase:")?;
            let account = keystore::import(&keystore_dir, &name, &block, &passphrase)?;
            println!("Account: {}", account.name);
            println!("Address: {}", account.address);
            Ok(())
        }
        Command::Export(args) => {
            let name = resolve_name(args.key_name)?;
            let passphrase = prompt("Enter passphrase:")?;
            let armored = keystore::export(&keystore_dir, &name, &passphrase)?;
            println!("{}", armored);
            Ok(())
        }
    }
}

fn resolve_name(flag: Option<String>) -> Result<String> {
    match flag {
        Some(name) => Ok(name),
        None => {
            let name = prompt("Enter account name:")?;
            if name.is_empty() {
                Err(anyhow!("account name must not be empty"))
            } else {
                Ok(name)
            }
        }
    }
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).context("read stdin")?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Read an armored key block, up to and including the END marker.
fn read_key_block() -> Result<String> {
    let mut block = String::new();
    for line in io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        block.push_str(&line);
        block.push('\n');
        if line.contains("-----END TENDERMINT PRIVATE KEY-----") {
            return Ok(block);
        }
    }
    Err(anyhow!("key block missing END marker"))
}
