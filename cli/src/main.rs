//! Command-line driver: one subcommand per request strategy, each printing
//! the dumped response.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harness_core::{capture, Config, HttpResponse, Part};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Send requests through each transport strategy and dump the responses")]
struct Args {
    /// Origin to talk to
    #[arg(long, env = "HARNESS_TARGET", default_value = "http://localhost:18888")]
    target: Url,

    /// Route http and https requests through this proxy
    #[arg(long, env = "HARNESS_PROXY")]
    proxy: Option<Url>,

    /// Root directory served for file:// URLs
    #[arg(long, env = "HARNESS_BASE_DIR", default_value = ".")]
    base_dir: PathBuf,

    /// Per-call deadline in seconds
    #[arg(long, env = "HARNESS_TIMEOUT_SECS", default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plain GET
    Get,
    /// GET with URL-encoded query parameters
    Query {
        #[arg(value_parser = parse_pair, required = true)]
        pairs: Vec<(String, String)>,
    },
    /// HEAD; the body is never printed
    Head,
    /// POST an application/x-www-form-urlencoded body
    Form {
        #[arg(value_parser = parse_pair, required = true)]
        pairs: Vec<(String, String)>,
    },
    /// POST a local file verbatim
    File {
        path: PathBuf,
        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// POST a text body
    Text {
        text: String,
        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// POST multipart/form-data; fields are sent before files
    Multipart {
        #[arg(long = "field", value_parser = parse_pair)]
        fields: Vec<(String, String)>,
        #[arg(long = "file", value_parser = parse_pair)]
        files: Vec<(String, String)>,
    },
    /// GET the same path repeatedly with a cookie-keeping session
    Cookie {
        #[arg(long, default_value = "/cookie")]
        path: String,
        #[arg(long, default_value_t = 2)]
        times: usize,
    },
    /// GET a URL through the proxy (the target itself when --proxy is unset)
    Proxy {
        #[arg(default_value = "http://github.com")]
        url: Url,
    },
    /// GET a file:// URL through the virtual transport
    Virtual {
        #[arg(default_value = "file:///Dockerfile")]
        url: Url,
    },
    /// DELETE without a body
    Delete,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;

    let args = Args::parse();
    let mut config = Config::new(args.target.clone());
    config.proxy = args.proxy.clone();
    config.base_dir = args.base_dir.clone();
    config.timeout = Duration::from_secs(args.timeout);

    run(&config, args.command)
}

fn run(config: &Config, command: Command) -> Result<()> {
    let target = &config.target;
    match command {
        Command::Get => print(&config.session(false).get(target)?, true),
        Command::Query { pairs } => print(&config.session(false).get_with_query(target, &pairs)?, true),
        Command::Head => print(&config.session(false).head(target)?, false),
        Command::Form { pairs } => print(&config.session(false).post_form(target, &pairs)?, true),
        Command::File { path, content_type } => {
            print(&config.session(false).post_file(target, &content_type, path)?, true)
        }
        Command::Text { text, content_type } => {
            print(&config.session(false).post_raw(target, &content_type, text.into_bytes())?, true)
        }
        Command::Multipart { fields, files } => {
            let parts = fields
                .into_iter()
                .map(|(name, value)| Part::field(name, value))
                .chain(files.into_iter().map(|(name, path)| Part::file(name, path)))
                .collect();
            print(&config.session(false).post_multipart(target, parts)?, true)
        }
        Command::Cookie { path, times } => {
            let url = target.join(&path).with_context(|| format!("joining {path:?} onto {target}"))?;
            let session = config.session(true);
            for _ in 0..times {
                print(&session.get(&url)?, true)?;
            }
            Ok(())
        }
        Command::Proxy { url } => {
            let mut proxied = config.clone();
            proxied.proxy = Some(config.proxy.clone().unwrap_or_else(|| target.clone()));
            print(&proxied.session(false).get(&url)?, true)
        }
        Command::Virtual { url } => print(&config.session(false).get(&url)?, true),
        Command::Delete => print(&config.session(false).delete(target)?, true),
    }
}

fn print(response: &HttpResponse, include_body: bool) -> Result<()> {
    info!(status = response.status, "response received");
    let mut out = std::io::stdout().lock();
    out.write_all(&capture::dump_response(response, include_body))?;
    out.write_all(b"\n")?;
    Ok(())
}
