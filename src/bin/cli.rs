use ansi_term::{self, Colour};
use clap::{Parser, Subcommand};
use lsat_proxy::secret_store::{SecretStore, SledSecretStore};

#[tokio::main]
async fn main() {
    banner("LSAT-proxy CLI tool");
    let cli = Cli::parse();

    match cli.command {
        Commands::Stats {} => {
            app_stats();
        }
        Commands::RevokeSecret { db_path, id_hash } => {
            revoke_secret(&db_path, &id_hash).await;
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "LSAT-Proxy management CLI tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// gets usage stats data
    Stats {},
    /// removes a secret record by its macaroon id hash, acting as a no-op
    /// if it does not exist
    RevokeSecret {
        /// path to the sled secret store
        #[arg(long)]
        db_path: String,
        /// hex-encoded 32-byte macaroon id hash
        #[arg(long)]
        id_hash: String,
    },
}

/// Prints out the `cli` tool banner
fn banner(quote: &str) {
    const BTC: &str = r"
        ──▄▄█▀▀▀▀▀█▄▄──
        ▄█▀░░▄░▄░░░░▀█▄
        █░░░▀█▀▀▀▀▄░░░█
        █░░░░█▄▄▄▄▀░░░█
        █░░░░█░░░░█░░░█
        ▀█▄░▀▀█▀█▀░░▄█▀
        ──▀▀█▄▄▄▄▄█▀▀──";
    let text = format!("{:-^34}\n{}\n", quote, Colour::Yellow.paint(BTC));
    println!("{}", text);
}

fn app_stats() {}

async fn revoke_secret(db_path: &str, id_hash_hex: &str) {
    let store = match SledSecretStore::open(db_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open secret store at {db_path}: {e}");
            return;
        }
    };

    let id_hash = match hex::decode(id_hash_hex).ok().and_then(|b| b.try_into().ok()) {
        Some(h) => h,
        None => {
            eprintln!("id_hash must be 64 hex characters (32 bytes)");
            return;
        }
    };

    match store.delete(id_hash).await {
        Ok(rows) => println!("revoked secret {id_hash_hex}, {rows} row(s) affected"),
        Err(e) => eprintln!("failed to revoke secret: {e}"),
    }
}
