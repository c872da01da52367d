use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "broker-cli")]
#[command(about = "Management CLI for the federated search broker", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, env = "BROKER_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broker status summary
    Status,
    /// Circuit state and performance of every backend server
    Servers,
    /// Force a server's circuit open
    Trip { server: String },
    /// Force a server's circuit closed
    Reset { server: String },
    /// Run a search and print the merged page
    Search {
        /// Resource type; omit for a system-wide search
        resource_type: Option<String>,
        /// Search parameters as key=value
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Continuation token from a previous page
        #[arg(long)]
        continuation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = match cli.command {
        Commands::Status => {
            client.get(format!("{}/admin/status", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Servers => {
            client.get(format!("{}/admin/servers", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Trip { server } => {
            client.post(format!("{}/admin/servers/{}/trip", cli.url, server))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Reset { server } => {
            client.post(format!("{}/admin/servers/{}/reset", cli.url, server))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Search { resource_type, params, continuation } => {
            let mut query: Vec<(String, String)> = Vec::new();
            for param in params {
                match param.split_once('=') {
                    Some((k, v)) => query.push((k.to_string(), v.to_string())),
                    None => return Err(format!("expected key=value, got '{}'", param).into()),
                }
            }
            if let Some(token) = continuation {
                query.push(("_continuation".to_string(), token));
            }
            client.get(format!("{}/{}", cli.url, resource_type.unwrap_or_default()))
                .query(&query)
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: broker returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
