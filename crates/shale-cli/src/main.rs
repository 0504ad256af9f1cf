//! Administrative user tool for the password file.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shale_auth::{PasswordFile, DEFAULT_COST};

/// Manage customers in the shale archive password file.
#[derive(Parser, Debug)]
#[command(name = "shale-user")]
#[command(about = "Manage customers in the shale archive password file")]
#[command(version)]
struct Cli {
    /// Path to the password file.
    #[arg(long, value_name = "FILE")]
    password_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List customer ids.
    List,

    /// Add a customer.
    Useradd {
        /// Customer id.
        cid: u64,

        /// Passphrase; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,

        /// Bcrypt cost for the stored hash.
        #[arg(long, default_value_t = DEFAULT_COST)]
        cost: u32,
    },

    /// Remove a customer.
    Userdel {
        /// Customer id.
        cid: u64,
    },

    /// Change a customer's passphrase.
    Passwd {
        /// Customer id.
        cid: u64,

        /// Passphrase; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let passwd = PasswordFile::open(&cli.password_file).with_context(|| {
        format!(
            "failed to open password file {}",
            cli.password_file.display()
        )
    })?;

    match cli.command {
        Command::List => {
            for (cid, locked) in passwd.list().context("failed to load password file")? {
                if locked {
                    println!("{cid} (locked)");
                } else {
                    println!("{cid}");
                }
            }
        }
        Command::Useradd {
            cid,
            password,
            cost,
        } => {
            let pass = read_passphrase(password)?;
            passwd
                .add_user(cid, &pass, cost)
                .with_context(|| format!("failed to add customer {cid}"))?;
            println!("added {cid}");
        }
        Command::Userdel { cid } => {
            passwd
                .delete_user(cid)
                .with_context(|| format!("failed to delete customer {cid}"))?;
            println!("deleted {cid}");
        }
        Command::Passwd { cid, password } => {
            let pass = read_passphrase(password)?;
            passwd
                .change_password(cid, &pass)
                .with_context(|| format!("failed to change password for {cid}"))?;
            println!("password changed for {cid}");
        }
    }
    Ok(())
}

fn read_passphrase(given: Option<String>) -> anyhow::Result<String> {
    if let Some(pass) = given {
        return Ok(pass);
    }
    let first = rpassword::prompt_password("Passphrase: ").context("failed to read passphrase")?;
    let second =
        rpassword::prompt_password("Confirm passphrase: ").context("failed to read passphrase")?;
    anyhow::ensure!(first == second, "passphrases do not match");
    anyhow::ensure!(!first.is_empty(), "passphrase must not be empty");
    Ok(first)
}
