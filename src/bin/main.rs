use clap::{Parser, Subcommand};
use finx_socket::{
    BatchInput, BatchRequest, Client, ClientContext, ClientResult, Resolved, SettingsOverlay,
    resolve_settings,
};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Command-line client for the FinX analytics socket
#[derive(Parser)]
#[command(name = "finx-socket")]
#[command(version)]
#[command(about = "Call FinX analytics methods over the streaming socket")]
struct Cli {
    /// Config file (default: <config dir>/finx/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API key (overrides FINX_API_KEY and the config file)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// API URL (overrides FINX_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Give up on results after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the methods the service offers
    Functions,
    /// Call one method
    Call {
        /// Method name (e.g., calculate_greeks)
        method: String,

        /// Parameter as key=value; values are parsed as JSON when possible
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
    /// Call one method for every row of a CSV file
    Batch {
        /// Method name (e.g., calculate_greeks)
        method: String,

        /// CSV file with one request per row
        #[arg(long)]
        input_file: PathBuf,

        /// Write ordered results to this CSV file instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,

        /// Parameter shared by every row, as key=value
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let overrides = SettingsOverlay {
        api_key: cli.api_key,
        api_url: cli.api_url,
        request_timeout_secs: cli.timeout,
        ..Default::default()
    };
    let settings = resolve_settings(cli.config.as_deref(), Some(overrides))?;
    let client = Client::connect_async(ClientContext::new(settings)?).await?;

    let outcome = execute(&client, cli.command).await;
    client.close().await;
    outcome
}

async fn execute(client: &Client, command: Commands) -> ClientResult<()> {
    match command {
        Commands::Functions => {
            let count = client.load_functions().await?;
            let functions = client.functions();
            for name in functions.names() {
                println!("{}", name);
            }
            eprintln!("{} method(s)", count);
            Ok(())
        }
        Commands::Call { method, params } => {
            client.load_functions().await?;
            let params: Map<String, Value> = params.into_iter().collect();
            let result = client.call(&method, params).await?;
            print_json(&result.to_json());
            Ok(())
        }
        Commands::Batch {
            method,
            input_file,
            output_file,
            params,
        } => {
            client.load_functions().await?;
            let mut request = BatchRequest::new(method, BatchInput::File(input_file))
                .with_params(params.into_iter().collect());
            let to_stdout = output_file.is_none();
            if let Some(path) = output_file {
                request = request.with_output_file(path);
            }
            let results = client.call_batch(request).await?;
            if to_stdout {
                let rendered: Vec<Value> = results
                    .iter()
                    .map(|result| match result {
                        Ok(resolved) => resolved.to_json(),
                        Err(e) => Resolved::RemoteError(e.to_string()).to_json(),
                    })
                    .collect();
                print_json(&Value::Array(rendered));
            }
            Ok(())
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
