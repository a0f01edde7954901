use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use audiosmith::api::ApiServerBuilder;
use audiosmith::client::{
    Assistant, AssistantClient, ChatsClient, ModelAssistant, ReplyMode, ServerConnection,
};
use audiosmith::conversation::{
    ChatBackend, ConversationStore, LocalChats, Message, Role, StoreOptions,
};
use audiosmith::db::{self, ChatRepo};
use audiosmith::llm::OpenAiCompat;
use audiosmith::turn::{TurnController, TurnOptions, TurnUpdate};
use audiosmith::voice::{
    AudioOutput, AudioSource, DeepgramTts, SpeechPlayback, SpeechSynthesizer, SttConfig,
    TranscriptStream, WavFileSource,
};
use audiosmith::{Config, Error};

/// Audiosmith - talk to an assistant, hear it answer
#[derive(Parser)]
#[command(name = "audiosmith", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use the local database and language model instead of a chat server
    #[arg(long, global = true, env = "AUDIOSMITH_LOCAL")]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,
    },
    /// Text chat on stdin
    Chat {
        /// Resume an existing conversation
        #[arg(long)]
        chat: Option<String>,
        /// Print replies as they stream in
        #[arg(long)]
        stream: bool,
    },
    /// Voice conversation
    Talk {
        /// Replay a 16-bit WAV file instead of the microphone
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Show replies without speaking them
        #[arg(long)]
        muted: bool,
        /// Resume an existing conversation
        #[arg(long)]
        chat: Option<String>,
    },
    /// List saved conversations
    History {
        /// Only titles containing this text
        query: Option<String>,
    },
    /// Print one conversation
    Show {
        chat_id: String,
    },
    /// Synthesize speech
    Speak {
        text: String,
        /// Write the audio here instead of playing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,audiosmith=info",
        1 => "info,audiosmith=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load();
    tracing::debug!(port = config.server.port, local = cli.local, "loaded configuration");

    match cli.command {
        Command::Serve { port, host } => serve(config, port, host).await,
        Command::Chat { chat, stream } => chat_loop(&config, cli.local, chat, stream).await,
        Command::Talk { input, muted, chat } => {
            talk(&config, cli.local, input, muted || config.voice.muted, chat).await
        }
        Command::History { query } => history(&config, cli.local, query.as_deref()).await,
        Command::Show { chat_id } => show(&config, cli.local, &chat_id).await,
        Command::Speak { text, output } => speak(&config, &text, output).await,
    }
}

/// Cancelled on Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            token.cancel();
        }
    });
    shutdown
}

async fn serve(config: Config, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.server.port);
    let host = host.unwrap_or(config.server.host);

    let pool = db::init(&config.server.db_path)?;
    tracing::info!(path = %config.server.db_path.display(), "database ready");

    let llm = OpenAiCompat::new(config.llm.base_url, config.api_keys.openai)
        .default_model(config.llm.model);

    let server = ApiServerBuilder::new(pool, port)
        .host(host)
        .tokens(config.server.tokens)
        .llm(Arc::new(llm))
        .prompts(config.llm.prompts)
        .build();

    server.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}

/// Where conversations live and who answers
struct Session {
    store: ConversationStore,
    assistant: Arc<dyn Assistant>,
}

fn session(config: &Config, local: bool) -> anyhow::Result<Session> {
    let options = StoreOptions {
        cache_dir: Some(config.client.cache_dir.clone()),
        ..StoreOptions::default()
    };

    let (backend, assistant): (Arc<dyn ChatBackend>, Arc<dyn Assistant>) = if local {
        let repo = ChatRepo::new(db::init(&config.server.db_path)?);
        let llm = OpenAiCompat::new(config.llm.base_url.clone(), config.api_keys.openai.clone())
            .default_model(config.llm.model.clone());
        (
            Arc::new(LocalChats::new(repo, config.client.user_id.clone())),
            Arc::new(ModelAssistant::new(Arc::new(llm), config.llm.prompts.clone())),
        )
    } else {
        let conn = ServerConnection::new(config.client.backend_url.clone(), config.client.token.clone())?;
        (
            Arc::new(ChatsClient::new(conn.clone())),
            Arc::new(AssistantClient::new(conn)),
        )
    };

    Ok(Session {
        store: ConversationStore::new(Some(backend), options),
        assistant,
    })
}

/// Print turn updates until the controller goes away
fn render(mut updates: mpsc::UnboundedReceiver<TurnUpdate>, echo_user: bool) {
    tokio::spawn(async move {
        let mut drafted = 0;
        while let Some(update) = updates.recv().await {
            match update {
                TurnUpdate::Preview(text) if !text.is_empty() => eprintln!("  … {text}"),
                TurnUpdate::Draft(text) => {
                    if drafted == 0 {
                        print!("assistant: ");
                    }
                    print!("{}", &text[drafted.min(text.len())..]);
                    let _ = std::io::stdout().flush();
                    drafted = text.len();
                }
                TurnUpdate::Message(message) => {
                    if drafted > 0 && message.role == Role::Assistant {
                        println!();
                        drafted = 0;
                        continue;
                    }
                    drafted = 0;
                    if message.role != Role::User || echo_user {
                        print_message(&message);
                    }
                }
                TurnUpdate::State(state) => tracing::debug!(?state, "turn"),
                TurnUpdate::Preview(_) => {}
            }
        }
    });
}

fn print_message(message: &Message) {
    println!("{}: {}", message.role, message.content);
}

async fn finish(store: &ConversationStore) {
    if let Err(e) = store.flush().await {
        tracing::warn!(error = %e, "failed to save conversation");
    }
}

async fn chat_loop(
    config: &Config,
    local: bool,
    chat: Option<String>,
    stream: bool,
) -> anyhow::Result<()> {
    let Session { store, assistant } = session(config, local)?;
    if let Some(chat_id) = chat {
        for message in store.switch_to(&chat_id).await.messages {
            print_message(&message);
        }
    }

    let options = TurnOptions {
        model: config.client.model.clone(),
        mode: if stream || config.voice.streamed {
            ReplyMode::Streamed
        } else {
            ReplyMode::Plain
        },
        muted: true,
        ..TurnOptions::default()
    };
    let controller = TurnController::new(store.clone(), assistant, None, options);
    type_messages(&store, controller, BufReader::new(tokio::io::stdin())).await
}

/// Submit one turn per typed line until EOF or Ctrl-C
async fn type_messages<R>(
    store: &ConversationStore,
    mut controller: TurnController,
    typed: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    render(controller.subscribe(), false);

    let shutdown = shutdown_on_ctrl_c();
    let mut lines = typed.lines();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                controller.stop();
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/new" => {
                    controller.stop();
                    let conversation = store.start_new().await;
                    println!("-- new conversation {}", conversation.id);
                }
                Some(line) => controller.submit(line),
                None => {
                    controller.settle().await;
                    break;
                }
            },
            () = controller.process_next_signal() => {}
        }
    }

    drop(controller);
    finish(store).await;
    println!("-- conversation {}", store.active_id());
    Ok(())
}

fn playback(config: &Config, muted: bool) -> anyhow::Result<Option<SpeechPlayback>> {
    if muted {
        return Ok(None);
    }
    let Some(key) = config.api_keys.deepgram.clone() else {
        return Ok(None);
    };

    let tts = DeepgramTts::new(key)?
        .url(config.voice.tts_url.clone())
        .model(config.voice.tts_model.clone());
    Ok(Some(SpeechPlayback::new(Arc::new(tts), output()?)))
}

#[cfg(feature = "device-audio")]
#[allow(clippy::unnecessary_wraps)]
fn output() -> anyhow::Result<Arc<dyn AudioOutput>> {
    Ok(Arc::new(audiosmith::voice::SpeakerOutput))
}

#[cfg(not(feature = "device-audio"))]
#[allow(clippy::unnecessary_wraps)]
fn output() -> anyhow::Result<Arc<dyn AudioOutput>> {
    tracing::warn!("built without device-audio, replies will not be audible");
    Ok(Arc::new(audiosmith::voice::NullOutput))
}

fn source(input: Option<PathBuf>) -> audiosmith::Result<Box<dyn AudioSource>> {
    match input {
        Some(path) => Ok(Box::new(WavFileSource::open(path)?)),
        None => microphone(),
    }
}

#[cfg(feature = "device-audio")]
fn microphone() -> audiosmith::Result<Box<dyn AudioSource>> {
    Ok(Box::new(audiosmith::voice::MicrophoneCapture::new()?))
}

#[cfg(not(feature = "device-audio"))]
fn microphone() -> audiosmith::Result<Box<dyn AudioSource>> {
    Err(Error::MediaAccess(
        "built without device-audio; pass --input <file.wav>".to_string(),
    ))
}

async fn talk(
    config: &Config,
    local: bool,
    input: Option<PathBuf>,
    muted: bool,
    chat: Option<String>,
) -> anyhow::Result<()> {
    let key = config
        .api_keys
        .deepgram
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DEEPGRAM_API_KEY is not set"))?;

    let session = session(config, local)?;
    if let Some(chat_id) = chat {
        session.store.switch_to(&chat_id).await;
    }

    let stt = SttConfig {
        url: config.voice.stt_url.clone(),
        model: config.voice.stt_model.clone(),
        language: config.voice.language.clone(),
        sample_rate: config.voice.sample_rate,
        endpointing_ms: config.voice.endpointing_ms,
        ..SttConfig::new(key)
    };

    let options = TurnOptions {
        model: config.client.model.clone(),
        mode: ReplyMode::Voice,
        muted,
        confidence_threshold: config.voice.confidence_threshold,
    };

    let from_microphone = input.is_none();
    let opened = match source(input) {
        Ok(source) => TranscriptStream::open(stt, Some(source)).await,
        Err(e) => Err(e),
    };

    converse(
        session,
        opened,
        from_microphone,
        playback(config, muted)?,
        options,
        BufReader::new(tokio::io::stdin()),
    )
    .await
}

/// Voice turns over an open transcript stream
///
/// Without a usable microphone the conversation continues on typed lines
/// from `typed`, replies still spoken through `playback`.
async fn converse<R>(
    session: Session,
    opened: audiosmith::Result<TranscriptStream>,
    from_microphone: bool,
    playback: Option<SpeechPlayback>,
    options: TurnOptions,
    typed: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let Session { store, assistant } = session;

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(Error::MediaAccess(reason)) if from_microphone => {
            tracing::warn!(reason = %reason, "microphone unavailable, reading typed messages");
            let notice = Message::system(format!(
                "Microphone unavailable ({reason}); type your messages instead"
            ));
            print_message(&notice);
            store.append(notice);
            let controller = TurnController::new(store.clone(), assistant, playback, options);
            return type_messages(&store, controller, typed).await;
        }
        Err(e) => {
            let notice = Message::system(format!("Error: {e}"));
            print_message(&notice);
            store.append(notice);
            finish(&store).await;
            return Err(e.into());
        }
    };
    let events = stream
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("transcript events already taken"))?;

    let mut controller = TurnController::new(store.clone(), assistant, playback, options);
    render(controller.subscribe(), true);

    eprintln!("listening - press Ctrl-C to stop");
    let result = controller.run(events, shutdown_on_ctrl_c()).await;

    stream.close().await;
    drop(controller);
    finish(&store).await;
    result?;
    Ok(())
}

async fn history(config: &Config, local: bool, query: Option<&str>) -> anyhow::Result<()> {
    let Session { store, .. } = session(config, local)?;
    store.refresh_history().await?;

    let chats = match query {
        Some(query) => store.search(query),
        None => store.history(),
    };
    if chats.is_empty() {
        println!("no conversations");
    }
    for chat in chats {
        println!("{}  {}  ({} messages)", chat.id, chat.title, chat.messages.len());
    }
    Ok(())
}

async fn show(config: &Config, local: bool, chat_id: &str) -> anyhow::Result<()> {
    let Session { store, .. } = session(config, local)?;
    let conversation = store.switch_to(chat_id).await;

    println!("# {}", conversation.title);
    if conversation.messages.is_empty() {
        println!("(no messages)");
    }
    for message in &conversation.messages {
        print_message(message);
    }
    Ok(())
}

async fn speak(config: &Config, text: &str, output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let key = config
        .api_keys
        .deepgram
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DEEPGRAM_API_KEY is not set"))?;
    let tts = DeepgramTts::new(key)?
        .url(config.voice.tts_url.clone())
        .model(config.voice.tts_model.clone());

    let language = config.voice.language.as_deref();
    if let Some(path) = output_path {
        let audio = tts.synthesize(text, language).await?;
        tokio::fs::write(&path, &audio).await?;
        println!("wrote {} bytes to {}", audio.len(), path.display());
        return Ok(());
    }

    let playback = SpeechPlayback::new(Arc::new(tts), output()?);
    playback.play(text, language).await?;
    Ok(())
}
