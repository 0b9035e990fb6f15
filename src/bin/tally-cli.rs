#![forbid(unsafe_code)]
//! Command-line client for a running tallychain node.

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color as TableColor, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tallychain::blockchain::{Block, Message, Payload};
use tallychain::network::{ChainResponse, PeerRequest};
use tallychain::transaction::Transaction;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(author, version, about = "Talk to a tallychain node", long_about = None)]
struct Cli {
    /// Node address (host:port)
    #[arg(long, global = true, default_value = "127.0.0.1:5000")]
    node: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every block
    Chain,
    /// Print one block
    Block { index: u64 },
    /// Balance of one account
    Balance { account: String },
    /// Whole balance table
    Balances,
    /// Queue a transfer between two accounts
    Send {
        sender: String,
        receiver: String,
        amount: i64,
    },
    /// Queue a deposit
    Deposit { account: String, amount: i64 },
    /// Queue a withdrawal
    Withdraw { account: String, amount: i64 },
    /// Pending transactions
    Pending,
    /// Mine the pending transactions into a block
    Mine,
    /// Stop an in-flight mining attempt
    Cancel,
    /// Post a chat message
    Post { author: String, text: String },
    /// Chat history
    Messages,
    /// Known peers
    Peers,
    /// Register a peer on this node only
    AddPeer { address: String },
    /// Register a node and forward it to every peer
    Join { address: String },
    /// Run a consensus round
    Resolve,
    /// Node statistics
    Stats,
}

struct NodeClient {
    client: Client,
    base: String,
}

impl NodeClient {
    fn new(node: &str, timeout: Duration) -> CliResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let host = node.trim_start_matches("http://").trim_end_matches('/');
        Ok(Self {
            client,
            base: format!("http://{}/api", host),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        let response = self.client.get(format!("{}{}", self.base, path)).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> CliResult<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> CliResult<T> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        // axum's own extractor rejections are plain text
        let reason = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(text);
        return Err(format!("{} ({})", reason, status).into());
    }
    Ok(serde_json::from_str(&text)?)
}

fn header(title: &str) {
    println!("{}", format!("== {} ==", title).bright_cyan().bold());
}

fn short(hash: &str) -> String {
    if hash.len() > 16 {
        format!("{}...", &hash[..16])
    } else {
        hash.to_string()
    }
}

fn describe(tx: &Transaction) -> String {
    match tx {
        Transaction::Transfer { sender, receiver, amount } => format!("{} -> {}: {}", sender, receiver, amount),
        Transaction::Deposit { account, amount } => format!("deposit {} +{}", account, amount),
        Transaction::Withdrawal { account, amount } => format!("withdraw {} -{}", account, amount),
    }
}

fn payload_summary(payload: &Payload) -> String {
    match payload {
        Payload::Message(Message { author, text }) => format!("{}: {}", author, text),
        Payload::Transactions(txs) if txs.is_empty() => "(no transactions)".to_string(),
        Payload::Transactions(txs) => txs.iter().map(describe).collect::<Vec<_>>().join("\n"),
    }
}

fn block_table(blocks: &[Block]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Index").add_attribute(Attribute::Bold),
            Cell::new("Hash").add_attribute(Attribute::Bold),
            Cell::new("Previous").add_attribute(Attribute::Bold),
            Cell::new("Nonce").add_attribute(Attribute::Bold),
            Cell::new("Payload").add_attribute(Attribute::Bold),
        ]);
    for block in blocks {
        let color = match block.payload {
            Payload::Message(_) => TableColor::Yellow,
            Payload::Transactions(_) => TableColor::Green,
        };
        table.add_row(vec![
            Cell::new(block.index),
            Cell::new(short(&block.hash)),
            Cell::new(short(&block.previous_hash)),
            Cell::new(block.nonce),
            Cell::new(payload_summary(&block.payload)).fg(color),
        ]);
    }
    table
}

fn print_block(block: &Block) {
    println!("{}", block_table(std::slice::from_ref(block)));
}

async fn queue(node: &NodeClient, tx: Transaction) -> CliResult<()> {
    let label = describe(&tx);
    let response: serde_json::Value = node.post("/transactions", &tx).await?;
    println!(
        "{} {} ({} pending)",
        "queued".green().bold(),
        label,
        response["pending"]
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    // mining can take a while at high difficulty
    let timeout = match cli.command {
        Commands::Mine | Commands::Post { .. } => Duration::from_secs(600),
        _ => Duration::from_secs(10),
    };
    let node = NodeClient::new(&cli.node, timeout)?;

    match cli.command {
        Commands::Chain => {
            let response: ChainResponse = node.get("/chain").await?;
            header(&format!("Chain ({} blocks)", response.length));
            println!("{}", block_table(&response.chain));
        }
        Commands::Block { index } => {
            let block: Block = node.get(&format!("/chain/{}", index)).await?;
            print_block(&block);
            println!("hash:          {}", block.hash);
            println!("previous_hash: {}", block.previous_hash);
            println!("timestamp:     {}", block.timestamp);
        }
        Commands::Balance { account } => {
            let response: serde_json::Value = node.get(&format!("/balance/{}", account)).await?;
            println!("{}: {}", account.bright_white(), response["balance"].to_string().bright_green());
        }
        Commands::Balances => {
            let balances: BTreeMap<String, i64> = node.get("/balances").await?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec!["Account", "Balance"]);
            for (account, balance) in &balances {
                table.add_row(vec![Cell::new(account), Cell::new(balance)]);
            }
            header("Balances");
            println!("{}", table);
        }
        Commands::Send { sender, receiver, amount } => {
            queue(&node, Transaction::transfer(sender, receiver, amount)).await?;
        }
        Commands::Deposit { account, amount } => {
            queue(&node, Transaction::deposit(account, amount)).await?;
        }
        Commands::Withdraw { account, amount } => {
            queue(&node, Transaction::withdrawal(account, amount)).await?;
        }
        Commands::Pending => {
            let response: serde_json::Value = node.get("/mempool").await?;
            let transactions: Vec<Transaction> = serde_json::from_value(response["transactions"].clone())?;
            header(&format!("Pending ({})", transactions.len()));
            for tx in &transactions {
                println!("  {}", describe(tx));
            }
        }
        Commands::Mine => {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")?);
            spinner.set_message("mining");
            spinner.enable_steady_tick(Duration::from_millis(120));
            let result: CliResult<Block> = node.post("/mine", &serde_json::json!({})).await;
            spinner.finish_and_clear();
            let block = result?;
            println!("{} block {}", "mined".green().bold(), block.index);
            print_block(&block);
        }
        Commands::Cancel => {
            let response: serde_json::Value = node.post("/mine/cancel", &serde_json::json!({})).await?;
            if response["cancelled"].as_bool().unwrap_or(false) {
                println!("{}", "mining cancelled".yellow());
            } else {
                println!("no mining in progress");
            }
        }
        Commands::Post { author, text } => {
            let block: Block = node.post("/messages", &Message::new(author, text)).await?;
            println!("{} in block {}", "posted".green().bold(), block.index);
        }
        Commands::Messages => {
            let messages: Vec<Message> = node.get("/messages").await?;
            header(&format!("Messages ({})", messages.len()));
            for message in &messages {
                println!("{}: {}", message.author.bright_yellow(), message.text);
            }
        }
        Commands::Peers => {
            let response: serde_json::Value = node.get("/peers").await?;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["Address", "Failures", "Chain length"]);
            for peer in response["peers"].as_array().into_iter().flatten() {
                let unreliable = peer["unreliable"].as_bool().unwrap_or(false);
                let address = Cell::new(peer["address"].as_str().unwrap_or("?"));
                table.add_row(vec![
                    if unreliable { address.fg(TableColor::Red) } else { address },
                    Cell::new(&peer["failures"]),
                    Cell::new(&peer["chain_length"]),
                ]);
            }
            header(&format!("Peers ({})", response["count"]));
            println!("{}", table);
        }
        Commands::AddPeer { address } => {
            let response: serde_json::Value = node.post("/peers", &PeerRequest { address }).await?;
            println!("{}", response["message"].as_str().unwrap_or("done"));
        }
        Commands::Join { address } => {
            let response: serde_json::Value = node.post("/peers/join", &PeerRequest { address }).await?;
            println!("{}", response["message"].as_str().unwrap_or("done"));
        }
        Commands::Resolve => {
            let response: serde_json::Value = node.post("/consensus/resolve", &serde_json::json!({})).await?;
            let message = response["message"].as_str().unwrap_or("done");
            if response["replaced"].as_bool().unwrap_or(false) {
                println!("{}", message.yellow().bold());
            } else {
                println!("{}", message.green());
            }
        }
        Commands::Stats => {
            let response: serde_json::Value = node.get("/stats").await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
