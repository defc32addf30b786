use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use vodarc::chat::catalog::{AssetCatalog, HttpCatalogSource, HttpEmoteProvider};
use vodarc::{
    delete_download, DownloadJob, DownloadTaskBuilder, FileStore, HttpChatSource,
    HttpImageFetcher, HttpManifestSource, HttpSegmentFetcher, JsonTaskStore, Status, TaskStore,
};

#[derive(Parser, Debug)]
#[command(version, about = "offline VOD and chat archiver", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    /// Directory holding task records
    #[arg(long, default_value = ".vodarc")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// register a new download and run it
    Download(DownloadArgs),
    /// continue an interrupted download
    Resume {
        id: u64,
        #[command(flatten)]
        net: NetArgs,
    },
    /// show one task, or all when no id is given
    Status { id: Option<u64> },
    /// remove a download's files and record
    Delete { id: u64 },
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// media playlist url (.m3u8) or a direct file url
    url: String,
    /// output directory
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
    /// window start in milliseconds
    #[arg(long, default_value_t = 0)]
    from_ms: u64,
    /// window end in milliseconds (defaults to the full source)
    #[arg(long, default_value_t = u64::MAX)]
    to_ms: u64,
    /// one file per segment instead of a single combined file
    #[arg(long)]
    split_segments: bool,
    /// archive the chat history alongside the media
    #[arg(long)]
    chat: bool,
    /// embed badge and emote images into the chat archive
    #[arg(long)]
    chat_emotes: bool,
    /// source video id, required for chat
    #[arg(long)]
    video_id: Option<String>,
    #[arg(long)]
    quality: Option<String>,
    #[command(flatten)]
    net: NetArgs,
}

#[derive(Args, Debug, Clone)]
struct NetArgs {
    /// chat history endpoint
    #[arg(long)]
    chat_endpoint: Option<String>,
    /// extra header for the chat endpoint, `name=value`, repeatable
    #[arg(long = "chat-header")]
    chat_headers: Vec<String>,
    #[arg(long, default_value_t = vodarc::consts::DEFAULT_CONCURRENT_LIMIT)]
    concurrency: usize,
    /// channel badge endpoint, `{channel_id}` template
    #[arg(long)]
    badges_url: Option<String>,
    #[arg(long)]
    global_badges_url: Option<String>,
    /// cheer emote endpoint, `{channel_id}` template
    #[arg(long)]
    cheer_url: Option<String>,
    /// platform emote image template with `{id}` and `{scale}`
    #[arg(long)]
    emote_template: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();
    let rt = tokio::runtime::Runtime::new().expect("init tokio failed");
    rt.block_on(run(cli)).expect("command failed");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = Arc::new(JsonTaskStore::new(&cli.state_dir));
    match cli.command {
        Commands::Download(args) => {
            let id = next_id(&store).await?;
            let mut task = DownloadTaskBuilder::default()
                .id(id)
                .source_url(args.url.clone())
                .download_path(args.out.to_string_lossy().into_owned())
                .from_time_ms(args.from_ms)
                .to_time_ms(args.to_ms)
                .playlist_to_file(!args.split_segments)
                .download_chat(args.chat)
                .download_chat_emotes(args.chat_emotes)
                .download_date(now_epoch_secs())
                .build()?;
            task.video_id = args.video_id.clone();
            task.quality = args.quality.clone();
            store.put(&task).await?;
            println!("registered task {}", id);
            execute(store, id, &args.net, args.chat_emotes).await
        }
        Commands::Resume { id, net } => {
            let task = store
                .get(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no task {}", id))?;
            execute(store, id, &net, task.download_chat_emotes).await
        }
        Commands::Status { id } => {
            let ids = match id {
                Some(id) => vec![id],
                None => store.list_ids().await?,
            };
            for id in ids {
                match store.get(id).await? {
                    Some(t) => println!(
                        "{:>4}  {:<12} media {}/{}  chat {}  {}",
                        t.id, t.status, t.progress, t.max_progress, t.chat_progress, t.source_url
                    ),
                    None => println!("{:>4}  not found", id),
                }
            }
            Ok(())
        }
        Commands::Delete { id } => {
            let files = FileStore::new(".");
            delete_download(store, &files, id).await?;
            println!("deleted task {}", id);
            Ok(())
        }
    }
}

async fn execute(
    store: Arc<JsonTaskStore>,
    id: u64,
    net: &NetArgs,
    load_catalog: bool,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let chat_endpoint = net
        .chat_endpoint
        .clone()
        .unwrap_or_else(|| "https://gql.twitch.tv/gql".to_owned());
    let chat = HttpChatSource::new(client.clone(), chat_endpoint)
        .with_headers(parse_headers(&net.chat_headers)?);

    let mut job = DownloadJob::new(
        Arc::clone(&store),
        FileStore::new("."),
        HttpManifestSource::new(client.clone()),
        HttpSegmentFetcher::new(client.clone()),
        chat,
        HttpImageFetcher::new(client.clone()),
    )
    .with_concurrency(net.concurrency);

    if load_catalog {
        job = job.with_catalog(build_catalog(&client, net, store.as_ref(), id).await?);
    }

    let bar = spawn_progress(Arc::clone(&store), id);
    let status = job.run(id).await?;
    bar.abort();
    match status {
        Status::Downloaded => println!("task {} finished", id),
        status => println!("task {} interrupted, now {} (resume to continue)", id, status),
    }
    Ok(())
}

async fn build_catalog(
    client: &reqwest::Client,
    net: &NetArgs,
    store: &JsonTaskStore,
    id: u64,
) -> anyhow::Result<AssetCatalog> {
    let channel_id = store.get(id).await?.and_then(|t| t.channel_id);
    let mut catalog_source = HttpCatalogSource::new(client.clone());
    if let (Some(channel), Some(global)) = (&net.badges_url, &net.global_badges_url) {
        catalog_source = catalog_source.with_badge_urls(channel.clone(), global.clone());
    }
    if let Some(cheer) = &net.cheer_url {
        catalog_source = catalog_source.with_cheer_url(cheer.clone());
    }
    let providers: Vec<HttpEmoteProvider> = Vec::new();
    let mut catalog = AssetCatalog::load(
        &catalog_source,
        &catalog_source,
        &providers,
        channel_id.as_deref(),
    )
    .await;
    if let Some(template) = &net.emote_template {
        catalog = catalog.with_emote_url_template(template.clone());
    }
    Ok(catalog)
}

/// Background progress display polling the persisted record.
fn spawn_progress(store: Arc<JsonTaskStore>, id: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40} {pos}/{len} media units  {msg}")
        {
            bar.set_style(style);
        }
        loop {
            if let Ok(Some(task)) = store.get(id).await {
                bar.set_length(u64::from(task.max_progress.max(1)));
                bar.set_position(u64::from(task.progress));
                if task.download_chat {
                    bar.set_message(format!("chat pages: {}", task.chat_progress));
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
}

async fn next_id(store: &JsonTaskStore) -> anyhow::Result<u64> {
    Ok(store.list_ids().await?.last().copied().unwrap_or(0) + 1)
}

fn parse_headers(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("header must be name=value: {}", entry))?;
        headers.insert(name.to_owned(), value.to_owned());
    }
    Ok(headers)
}

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
