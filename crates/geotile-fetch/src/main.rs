//! Command line fetcher for platform endpoints.
//!
//! Fetches one path through [`ApiClient`] with the retry, cancellation and
//! scheduling machinery of the SDK, and reports the outcome.
//!
//! Run with: `cargo run -p geotile-fetch -- https://tiles.example.com/v1 /tiles/12/2200/1343`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, mpsc};
use std::time::Duration;
use std::{fs, thread};

use clap::Parser;
use geotile_client::{
    ApiClient, ApiRequest, AuthenticationSettings, ClientSettings, HttpResponse, Network,
    ReqwestNetwork, RetryConfig, RetrySettings,
};
use geotile_core::thread::{TaskScheduler, ThreadPoolTaskScheduler};
use geotile_core::{ApiError, ApiResponse, CancellationContext, ErrorCode};

#[derive(Parser, Debug)]
#[command(about = "Fetch a platform resource through the geotile client")]
struct CliArgs {
    /// Base URL of the service.
    base_url: String,

    /// Path of the resource, relative to the base URL.
    path: String,

    /// Query parameter as `name=value`. May be repeated.
    #[arg(long = "query", short = 'q', value_parser = parse_query)]
    query: Vec<(String, String)>,

    /// Bearer token sent with the request.
    #[arg(long, env = "GEOTILE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Retries after the first attempt.
    #[arg(long, default_value_t = RetryConfig::default().max_attempts)]
    max_attempts: u32,

    /// Per-attempt timeout and total backdown budget, in seconds.
    #[arg(long, default_value_t = RetryConfig::default().timeout_secs)]
    timeout_secs: u64,

    /// Wait before the first retry, in milliseconds.
    #[arg(long, default_value_t = RetryConfig::default().initial_backdown_period_ms)]
    initial_backdown_ms: u64,

    /// Upper bound of a single backdown wait, in milliseconds.
    #[arg(long)]
    max_backdown_ms: Option<u64>,

    /// Run the request on a worker pool of this many threads.
    #[arg(long)]
    threads: Option<usize>,

    /// Cancel the request if it has not finished after this many seconds.
    #[arg(long)]
    cancel_after_secs: Option<u64>,

    /// Write the response body to this file.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

/// Parse a `name=value` query parameter.
fn parse_query(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

impl CliArgs {
    fn retry_settings(&self) -> RetrySettings {
        RetrySettings::from(RetryConfig {
            max_attempts: self.max_attempts,
            timeout_secs: self.timeout_secs,
            initial_backdown_period_ms: self.initial_backdown_ms,
            max_backdown_period_ms: self.max_backdown_ms,
        })
    }

    fn request(&self) -> ApiRequest {
        self.query.iter().fold(ApiRequest::new(&self.path), |request, (name, value)| {
            request.with_query(name.as_str(), value.as_str())
        })
    }
}

fn main() -> ExitCode {
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let args = CliArgs::parse();
    match run(&args) {
        Ok(response) => {
            tracing::info!(status = response.status, bytes = response.body.len(), "fetched");
            if let Some(path) = &args.output {
                if let Err(e) = fs::write(path, &response.body) {
                    tracing::error!(path = %path.display(), "failed to write output: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(code = %error.code(), "{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &CliArgs) -> ApiResponse<HttpResponse> {
    let network: Arc<dyn Network> = Arc::new(ReqwestNetwork::new()?);
    let mut settings = ClientSettings::new(network).with_retry_settings(args.retry_settings());
    if let Some(token) = &args.token {
        settings = settings.with_authentication(AuthenticationSettings::with_static_token(token));
    }

    let request = args.request();
    match args.threads {
        None => {
            let client = ApiClient::new(&args.base_url, settings);
            let context = CancellationContext::new();
            if let Some(secs) = args.cancel_after_secs {
                let context = context.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_secs(secs));
                    tracing::info!("cancelling request");
                    context.cancel_operation();
                });
            }
            client.call_api(&request, &context)
        }
        Some(threads) => {
            let scheduler: Arc<dyn TaskScheduler> = Arc::new(ThreadPoolTaskScheduler::new(threads)?);
            let client = ApiClient::new(&args.base_url, settings.with_scheduler(scheduler));

            let (sender, receiver) = mpsc::channel();
            let token = client.call_api_async(request, move |response| {
                let _ = sender.send(response);
            });

            match args.cancel_after_secs {
                Some(secs) => match receiver.recv_timeout(Duration::from_secs(secs)) {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::info!("cancelling request");
                        token.cancel();
                        receiver.recv().map_err(|_| dropped_callback())?
                    }
                },
                None => receiver.recv().map_err(|_| dropped_callback())?,
            }
        }
    }
}

fn dropped_callback() -> ApiError {
    ApiError::new(ErrorCode::Unknown, "request finished without a result")
}
