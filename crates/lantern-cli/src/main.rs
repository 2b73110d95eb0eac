use std::env;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lantern_contracts::query::{parse_intent, CommandInvocation, QueryIntent, CHAT_HELP_COMMANDS};
use lantern_contracts::session::{FileAnalysisResult, SessionState};
use lantern_engine::{Engine, Resolution};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "lantern", version, about = "Answer-engine front end")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Ask(AskArgs),
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    path: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lantern error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Ask(args) => run_ask(args),
        Command::Analyze(args) => run_analyze(args),
    }
}

fn build_engine(
    out: PathBuf,
    events: Option<PathBuf>,
    text_model: Option<String>,
    image_model: Option<String>,
) -> Result<Engine> {
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    Engine::new(out, events_path, text_model, image_model)
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let mut engine = build_engine(args.out, args.events, args.text_model, args.image_model)?;
    let code = match engine.submit(&args.query) {
        Ok(Resolution::Committed(state)) => {
            render_state(&state);
            0
        }
        Ok(Resolution::Superseded) => 0,
        Err(err) => {
            println!("Query failed: {err:#}");
            1
        }
    };
    engine.finish()?;
    Ok(code)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let mut engine = build_engine(args.out, args.events, None, None)?;
    let code = match engine.analyze_file(&args.path) {
        Ok(state) => {
            render_state(&state);
            0
        }
        Err(err) => {
            println!("Analysis failed: {err:#}");
            1
        }
    };
    engine.finish()?;
    Ok(code)
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut engine = build_engine(args.out, args.events, args.text_model, args.image_model)?;
    let mut voice = VoiceSession::new(default_speech_backend());
    let mut pending_voice: Option<String> = None;

    println!("Lantern chat started. Ask a question, prefix with @ to generate an image, /help for commands.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        match voice.poll_utterance() {
            Some(Ok(utterance)) => {
                println!("Voice captured: \"{utterance}\" (use /send to submit it)");
                pending_voice = Some(utterance);
            }
            Some(Err(message)) => println!("Voice capture failed: {message}"),
            None => {}
        }

        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        match parse_intent(input) {
            QueryIntent::Noop => continue,
            QueryIntent::Command(invocation) => {
                if invocation.action == "quit" {
                    break;
                }
                handle_command(&invocation, &mut engine, &mut voice, &mut pending_voice);
            }
            QueryIntent::Search { .. } | QueryIntent::GenerateImage { .. } => {
                submit_and_render(&mut engine, input);
            }
        }
    }

    voice.stop();
    engine.finish()?;
    Ok(())
}

fn handle_command(
    invocation: &CommandInvocation,
    engine: &mut Engine,
    voice: &mut VoiceSession,
    pending_voice: &mut Option<String>,
) {
    match invocation.action.as_str() {
        "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
        "reset" => {
            engine.reset();
            *pending_voice = None;
            println!("Session reset.");
        }
        "set_text_model" => {
            let model = arg_string(invocation, "model");
            if model.is_empty() {
                println!(
                    "Text model: {}",
                    engine.text_model().unwrap_or("(registry default)")
                );
            } else {
                engine.set_text_model(Some(model.clone()));
                println!("Text model set to {model}");
            }
        }
        "set_image_model" => {
            let model = arg_string(invocation, "model");
            if model.is_empty() {
                println!(
                    "Image model: {}",
                    engine.image_model().unwrap_or("(registry default)")
                );
            } else {
                engine.set_image_model(Some(model.clone()));
                println!("Image model set to {model}");
            }
        }
        "analyze" => {
            let path = arg_string(invocation, "path");
            if path.is_empty() {
                println!("/analyze requires a file path");
                return;
            }
            match engine.analyze_file(&PathBuf::from(path)) {
                Ok(state) => render_state(&state),
                Err(err) => println!("Analysis failed: {err:#}"),
            }
        }
        "classify" => {
            let path = arg_string(invocation, "path");
            if path.is_empty() {
                println!("/classify requires a file path");
                return;
            }
            match engine.classify_file(&PathBuf::from(path)) {
                Ok(labels) => println!(
                    "{}",
                    serde_json::to_string_pretty(&labels)
                        .unwrap_or_else(|_| labels.to_string())
                ),
                Err(err) => println!("Classification failed: {err:#}"),
            }
        }
        "voice_start" => match voice.start() {
            Ok(()) => println!("Listening... captured speech becomes your next query."),
            Err(message) => println!("Voice unavailable: {message}"),
        },
        "voice_stop" => {
            voice.stop();
            println!("Stopped listening.");
        }
        "send" => match pending_voice.take() {
            Some(text) => submit_and_render(engine, &text),
            None => println!("Nothing captured to send."),
        },
        "unknown" => {
            let command = invocation
                .args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            println!("Unknown command /{command}. Try /help.");
        }
        other => println!("Unhandled command action '{other}'."),
    }
}

fn arg_string(invocation: &CommandInvocation, key: &str) -> String {
    invocation
        .args
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn submit_and_render(engine: &mut Engine, raw: &str) {
    match engine.submit(raw) {
        Ok(Resolution::Committed(state)) => {
            if let Some(reason) = engine.last_fallback_reason() {
                println!("Note: {reason}");
            }
            render_state(&state);
        }
        Ok(Resolution::Superseded) => println!("Superseded by a newer query."),
        Err(err) => println!("Query failed: {err:#}"),
    }
}

fn render_state(state: &SessionState) {
    match state {
        SessionState::Idle => println!("(idle)"),
        SessionState::Loading => println!("(loading)"),
        SessionState::Search(session) => {
            println!("Question: {}", session.question);
            if !session.sources.is_empty() {
                println!("Sources:");
                for (idx, source) in session.sources.iter().enumerate() {
                    println!("  {}. {}", idx + 1, source.title);
                    println!("     {}", source.link);
                    if !source.snippet.is_empty() {
                        println!("     {}", source.snippet);
                    }
                }
            }
            println!("Answer:");
            println!("{}", session.answer);
            if !session.similar_topics.is_empty() {
                println!("Related topics:");
                for topic in &session.similar_topics {
                    println!("  - {topic}");
                }
            }
        }
        SessionState::Image(image) => {
            println!(
                "Generated image for \"{}\": {}",
                image.prompt,
                image.artifact_path.display()
            );
        }
        SessionState::File(FileAnalysisResult::Image {
            description,
            detected_objects,
        }) => {
            println!("Image analysis:");
            println!("{description}");
            println!(
                "Detected objects: {}",
                serde_json::to_string(detected_objects)
                    .unwrap_or_else(|_| detected_objects.to_string())
            );
        }
        SessionState::File(FileAnalysisResult::Code { explanation }) => {
            println!("Code explanation:");
            println!("{explanation}");
        }
        SessionState::Error(message) => println!("Error: {message}"),
    }
}

/// Platform speech capture behind a trait so the session state machine
/// works (and tests run) without any audio stack. `listen` blocks until
/// an utterance is recognized, an error occurs, or the stop flag is set.
trait SpeechBackend: Send + Sync {
    fn listen(&self, stop: &AtomicBool) -> std::result::Result<String, String>;
}

/// Reads the utterance from a transcript file named by
/// `LANTERN_VOICE_TRANSCRIPT`. Stands in for platform speech-to-text the
/// way the dryrun image provider stands in for hosted generation.
struct TranscriptFileBackend {
    path: PathBuf,
}

impl SpeechBackend for TranscriptFileBackend {
    fn listen(&self, _stop: &AtomicBool) -> std::result::Result<String, String> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|err| format!("transcript read failed ({}): {err}", self.path.display()))?;
        content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| "transcript is empty".to_string())
    }
}

fn default_speech_backend() -> Option<Arc<dyn SpeechBackend>> {
    let path = env::var("LANTERN_VOICE_TRANSCRIPT")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;
    Some(Arc::new(TranscriptFileBackend {
        path: PathBuf::from(path),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceState {
    Idle,
    Listening,
}

/// `Idle -> Listening -> Idle`: a recognized utterance or an error both
/// end the capture. Only one listening session may be active; starting a
/// new one stops the previous worker first. The utterance is never
/// auto-submitted, the user confirms with /send.
struct VoiceSession {
    backend: Option<Arc<dyn SpeechBackend>>,
    state: VoiceState,
    receiver: Option<mpsc::Receiver<std::result::Result<String, String>>>,
    handle: Option<thread::JoinHandle<()>>,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl VoiceSession {
    fn new(backend: Option<Arc<dyn SpeechBackend>>) -> Self {
        Self {
            backend,
            state: VoiceState::Idle,
            receiver: None,
            handle: None,
            stop_flag: None,
        }
    }

    fn is_listening(&self) -> bool {
        self.state == VoiceState::Listening
    }

    fn start(&mut self) -> std::result::Result<(), String> {
        let Some(backend) = self.backend.clone() else {
            return Err("speech recognition not supported".to_string());
        };
        if self.is_listening() {
            self.stop();
        }

        let (tx, rx) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("lantern-voice".to_string())
            .spawn(move || {
                let _ = tx.send(backend.listen(&worker_stop));
            })
            .map_err(|err| format!("voice thread spawn failed: {err}"))?;

        self.receiver = Some(rx);
        self.handle = Some(handle);
        self.stop_flag = Some(stop_flag);
        self.state = VoiceState::Listening;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.receiver = None;
        self.stop_flag = None;
        self.state = VoiceState::Idle;
    }

    fn poll_utterance(&mut self) -> Option<std::result::Result<String, String>> {
        let outcome = self.receiver.as_ref()?.try_recv();
        match outcome {
            Ok(result) => {
                self.finish_capture();
                Some(result)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.finish_capture();
                None
            }
        }
    }

    fn finish_capture(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.receiver = None;
        self.stop_flag = None;
        self.state = VoiceState::Idle;
    }
}
