use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use lantern_contracts::events::{EventPayload, EventWriter};
use lantern_contracts::models::{ModelSelection, ModelSelector};
use lantern_contracts::providers::{NamedProvider, ProviderRegistry};
use lantern_contracts::query::{parse_intent, QueryIntent};
use lantern_contracts::session::{
    FileAnalysisResult, GeneratedImageResult, SearchSession, SessionState, SourceItem,
};
use lantern_contracts::summary::{write_summary, SessionSummary};
use lantern_contracts::LanternError;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const SEARCH_PAGE_SIZE: u64 = 6;

const ANSWER_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer questions based on the provided sources. Be concise and accurate.";
const ANSWER_TEMPERATURE: f64 = 0.7;
const ANSWER_MAX_TOKENS: u64 = 500;

const TOPICS_SYSTEM_PROMPT: &str =
    "Generate 3 related search queries based on the user's question. Make them specific and interesting.";
const TOPICS_TEMPERATURE: f64 = 0.8;
const TOPICS_MAX_TOKENS: u64 = 200;

const DESCRIBE_IMAGE_PROMPT: &str = "Describe this image in detail";
const VISION_MAX_TOKENS: u64 = 500;
const VISION_MAX_DIM: u32 = 1024;

// The request already caps sources at SEARCH_PAGE_SIZE; the character cap
// guards the model context window against pathological snippets.
const MAX_PROMPT_SOURCES: usize = 6;
const MAX_GROUNDING_CHARS: usize = 8000;

const DRYRUN_IMAGE_DIM: u32 = 512;

pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    fn search(&self, query: &str) -> std::result::Result<Vec<SourceItem>, LanternError>;
}

pub trait AnswerProvider: Send + Sync {
    fn name(&self) -> &str;
    fn answer(
        &self,
        model: &str,
        question: &str,
        sources: &[SourceItem],
    ) -> std::result::Result<String, LanternError>;
    fn related_topics(
        &self,
        model: &str,
        question: &str,
    ) -> std::result::Result<Vec<String>, LanternError>;
}

pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;
    fn describe_image(
        &self,
        model: &str,
        image_path: &Path,
        prompt: &str,
    ) -> std::result::Result<String, LanternError>;
    fn detect_objects(
        &self,
        model: &str,
        image_path: &Path,
    ) -> std::result::Result<Value, LanternError>;
    fn classify_image(
        &self,
        model: &str,
        image_path: &Path,
    ) -> std::result::Result<Value, LanternError>;
    fn explain_code(
        &self,
        model: &str,
        code: &str,
    ) -> std::result::Result<String, LanternError>;
}

#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub out_dir: PathBuf,
    pub prompt: String,
    pub model: String,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &ImageGenRequest,
    ) -> std::result::Result<GeneratedImageResult, LanternError>;
}

impl NamedProvider for Box<dyn ImageProvider> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }
}

/// An accepted query, tagged with the generation it belongs to. Resolving
/// a submission whose generation is no longer current is a no-op.
#[derive(Debug, Clone)]
pub struct Submission {
    generation: u64,
    mode: SubmissionMode,
}

#[derive(Debug, Clone)]
enum SubmissionMode {
    Search { question: String },
    Image { prompt: String },
}

impl SubmissionMode {
    fn label(&self) -> &'static str {
        match self {
            Self::Search { .. } => "search",
            Self::Image { .. } => "image",
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::Search { question } => question,
            Self::Image { prompt } => prompt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Committed(SessionState),
    Superseded,
}

struct SerperClient {
    api_base: String,
    http: HttpClient,
}

impl SerperClient {
    fn from_env() -> Self {
        Self {
            api_base: api_base_from_env("SERPER_API_BASE", "https://google.serper.dev"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> std::result::Result<String, LanternError> {
        non_empty_env("SERPER_API_KEY").ok_or(LanternError::MissingCredential {
            provider: "serper",
            variable: "SERPER_API_KEY",
        })
    }
}

impl SearchProvider for SerperClient {
    fn name(&self) -> &str {
        "serper"
    }

    fn search(&self, query: &str) -> std::result::Result<Vec<SourceItem>, LanternError> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/search", self.api_base);
        let payload = json!({ "q": query, "num": SEARCH_PAGE_SIZE });
        let response = self
            .http
            .post(&endpoint)
            .header("X-API-KEY", api_key)
            .json(&payload)
            .send()
            .map_err(|err| {
                LanternError::external("serper", format!("request failed ({endpoint}): {err}"))
            })?;
        let parsed = response_json_or_error("serper", response)?;
        map_organic_results(&parsed)
    }
}

fn map_organic_results(payload: &Value) -> std::result::Result<Vec<SourceItem>, LanternError> {
    let rows = payload
        .get("organic")
        .and_then(Value::as_array)
        .ok_or_else(|| LanternError::external("serper", "response missing 'organic' results"))?;
    Ok(rows
        .iter()
        .map(|row| SourceItem {
            title: string_field(row, "title"),
            link: string_field(row, "link"),
            snippet: string_field(row, "snippet"),
        })
        .collect())
}

fn string_field(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

struct TogetherClient {
    api_base: String,
    http: HttpClient,
}

impl TogetherClient {
    fn from_env() -> Self {
        Self {
            api_base: api_base_from_env("TOGETHER_API_BASE", "https://api.together.xyz/v1"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> std::result::Result<String, LanternError> {
        non_empty_env("TOGETHER_API_KEY").ok_or(LanternError::MissingCredential {
            provider: "together",
            variable: "TOGETHER_API_KEY",
        })
    }

    fn chat_completion(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f64,
        max_tokens: u64,
    ) -> std::result::Result<String, LanternError> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let mut request = self.http.post(&endpoint).bearer_auth(&api_key).json(&payload);
        if let Some(helicone_key) = non_empty_env("HELICONE_API_KEY") {
            request = request.header("Helicone-Auth", format!("Bearer {helicone_key}"));
        }
        let response = request.send().map_err(|err| {
            LanternError::external("together", format!("request failed ({endpoint}): {err}"))
        })?;
        let parsed = response_json_or_error("together", response)?;
        chat_message_content("together", &parsed)
    }
}

impl AnswerProvider for TogetherClient {
    fn name(&self) -> &str {
        "together"
    }

    fn answer(
        &self,
        model: &str,
        question: &str,
        sources: &[SourceItem],
    ) -> std::result::Result<String, LanternError> {
        let prompt = build_answer_prompt(question, sources);
        self.chat_completion(
            model,
            ANSWER_SYSTEM_PROMPT,
            &prompt,
            ANSWER_TEMPERATURE,
            ANSWER_MAX_TOKENS,
        )
    }

    fn related_topics(
        &self,
        model: &str,
        question: &str,
    ) -> std::result::Result<Vec<String>, LanternError> {
        let user = format!("Original question: \"{question}\"\n\nGenerate 3 related questions:");
        let content = self.chat_completion(
            model,
            TOPICS_SYSTEM_PROMPT,
            &user,
            TOPICS_TEMPERATURE,
            TOPICS_MAX_TOKENS,
        )?;
        Ok(parse_related_topics(&content))
    }
}

struct HuggingFaceClient {
    api_base: String,
    http: HttpClient,
}

impl HuggingFaceClient {
    fn from_env() -> Self {
        Self {
            api_base: api_base_from_env(
                "HF_API_BASE",
                "https://api-inference.huggingface.co/models",
            ),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> std::result::Result<String, LanternError> {
        non_empty_env("HF_API_TOKEN")
            .or_else(|| non_empty_env("HUGGINGFACE_TOKEN"))
            .ok_or(LanternError::MissingCredential {
                provider: "huggingface",
                variable: "HF_API_TOKEN",
            })
    }

    fn model_endpoint(&self, model: &str) -> String {
        format!("{}/{}", self.api_base, model)
    }

    fn post_binary(
        &self,
        model: &str,
        image_path: &Path,
    ) -> std::result::Result<Value, LanternError> {
        let api_key = Self::api_key()?;
        let bytes = fs::read(image_path).map_err(|err| {
            LanternError::validation(format!("failed reading {}: {err}", image_path.display()))
        })?;
        let endpoint = self.model_endpoint(model);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .map_err(|err| {
                LanternError::external("huggingface", format!("request failed ({endpoint}): {err}"))
            })?;
        response_json_or_error("huggingface", response)
    }
}

impl InferenceProvider for HuggingFaceClient {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn describe_image(
        &self,
        model: &str,
        image_path: &Path,
        prompt: &str,
    ) -> std::result::Result<String, LanternError> {
        let api_key = Self::api_key()?;
        let data_url = vision_image_data_url(image_path)?;
        let endpoint = format!("{}/{}/v1/chat/completions", self.api_base, model);
        let payload = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": VISION_MAX_TOKENS,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .map_err(|err| {
                LanternError::external("huggingface", format!("request failed ({endpoint}): {err}"))
            })?;
        let parsed = response_json_or_error("huggingface", response)?;
        chat_message_content("huggingface", &parsed)
    }

    fn detect_objects(
        &self,
        model: &str,
        image_path: &Path,
    ) -> std::result::Result<Value, LanternError> {
        self.post_binary(model, image_path)
    }

    fn classify_image(
        &self,
        model: &str,
        image_path: &Path,
    ) -> std::result::Result<Value, LanternError> {
        self.post_binary(model, image_path)
    }

    fn explain_code(
        &self,
        model: &str,
        code: &str,
    ) -> std::result::Result<String, LanternError> {
        let api_key = Self::api_key()?;
        let endpoint = self.model_endpoint(model);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&json!({ "inputs": code }))
            .send()
            .map_err(|err| {
                LanternError::external("huggingface", format!("request failed ({endpoint}): {err}"))
            })?;
        let parsed = response_json_or_error("huggingface", response)?;
        Ok(inference_text(&parsed))
    }
}

impl ImageProvider for HuggingFaceClient {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn generate(
        &self,
        request: &ImageGenRequest,
    ) -> std::result::Result<GeneratedImageResult, LanternError> {
        let api_key = Self::api_key()?;
        let endpoint = self.model_endpoint(&request.model);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&json!({ "inputs": request.prompt }))
            .send()
            .map_err(|err| {
                LanternError::external("huggingface", format!("request failed ({endpoint}): {err}"))
            })?;
        let (bytes, mime) = response_bytes_or_error("huggingface", response)?;
        if bytes.is_empty() {
            return Err(LanternError::external(
                "huggingface",
                "image response carried no bytes",
            ));
        }
        let artifact_path = save_artifact(
            &request.out_dir,
            &request.prompt,
            &bytes,
            extension_for_mime(mime.as_deref()),
        )?;
        Ok(GeneratedImageResult {
            artifact_path,
            prompt: request.prompt.clone(),
        })
    }
}

/// Offline provider: paints a deterministic solid-color artifact derived
/// from the prompt so the chat loop works without any credentials.
pub struct DryrunImageProvider;

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        request: &ImageGenRequest,
    ) -> std::result::Result<GeneratedImageResult, LanternError> {
        fs::create_dir_all(&request.out_dir).map_err(|err| {
            LanternError::external(
                "dryrun",
                format!("failed to create {}: {err}", request.out_dir.display()),
            )
        })?;
        let stamp = timestamp_millis();
        let artifact_path = request.out_dir.join(format!(
            "artifact-{}-{}.png",
            stamp,
            short_id(&request.prompt, stamp as u64)
        ));
        write_dryrun_image(&artifact_path, DRYRUN_IMAGE_DIM, DRYRUN_IMAGE_DIM, &request.prompt)
            .map_err(|err| LanternError::external("dryrun", err.to_string()))?;
        Ok(GeneratedImageResult {
            artifact_path,
            prompt: request.prompt.clone(),
        })
    }
}

pub fn default_image_providers() -> ProviderRegistry<Box<dyn ImageProvider>> {
    ProviderRegistry::new(vec![
        Box::new(HuggingFaceClient::from_env()) as Box<dyn ImageProvider>,
        Box::new(DryrunImageProvider),
    ])
}

/// The external collaborators an engine talks to, bundled so tests can
/// swap in fakes wholesale.
pub struct ClientSet {
    pub search: Arc<dyn SearchProvider>,
    pub answerer: Arc<dyn AnswerProvider>,
    pub inference: Arc<dyn InferenceProvider>,
    pub image_providers: ProviderRegistry<Box<dyn ImageProvider>>,
}

impl ClientSet {
    pub fn from_env() -> Self {
        Self {
            search: Arc::new(SerperClient::from_env()),
            answerer: Arc::new(TogetherClient::from_env()),
            inference: Arc::new(HuggingFaceClient::from_env()),
            image_providers: default_image_providers(),
        }
    }
}

/// The orchestration core. Owns the single `SessionState`, decides which
/// clients a submission touches, fans independent calls out on worker
/// threads and joins them, and discards resolutions that a newer
/// submission has superseded.
pub struct Engine {
    out_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    selector: ModelSelector,
    text_model: Option<String>,
    image_model: Option<String>,
    search: Arc<dyn SearchProvider>,
    answerer: Arc<dyn AnswerProvider>,
    inference: Arc<dyn InferenceProvider>,
    image_providers: ProviderRegistry<Box<dyn ImageProvider>>,
    state: SessionState,
    generation: u64,
    last_fallback_reason: Option<String>,
    started_at: String,
    summary_path: PathBuf,
    searches: u64,
    images_generated: u64,
    files_analyzed: u64,
    errors: u64,
}

impl Engine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        text_model: Option<String>,
        image_model: Option<String>,
    ) -> Result<Self> {
        Self::with_clients(
            out_dir,
            events_path,
            text_model,
            image_model,
            ClientSet::from_env(),
        )
    }

    pub fn with_clients(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        text_model: Option<String>,
        image_model: Option<String>,
        clients: ClientSet,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        let session_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4()));
        let events = EventWriter::new(events_path.into(), session_id.clone());
        let summary_path = out_dir.join("summary.json");
        let started_at = now_utc_iso();

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
            })),
        )?;

        Ok(Self {
            out_dir,
            session_id,
            events,
            selector: ModelSelector::new(None),
            text_model,
            image_model,
            search: clients.search,
            answerer: clients.answerer,
            inference: clients.inference,
            image_providers: clients.image_providers,
            state: SessionState::Idle,
            generation: 0,
            last_fallback_reason: None,
            started_at,
            summary_path,
            searches: 0,
            images_generated: 0,
            files_analyzed: 0,
            errors: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn set_text_model(&mut self, model: Option<String>) {
        self.text_model = model;
    }

    pub fn text_model(&self) -> Option<&str> {
        self.text_model.as_deref()
    }

    pub fn set_image_model(&mut self, model: Option<String>) {
        self.image_model = model;
    }

    pub fn image_model(&self) -> Option<&str> {
        self.image_model.as_deref()
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Validates the raw input and opens a new submission generation.
    /// The state is `Loading` from here until the submission resolves.
    pub fn begin(&mut self, raw: &str) -> Result<Submission> {
        let mode = match parse_intent(raw) {
            QueryIntent::Noop => {
                return Err(LanternError::validation("query is empty").into());
            }
            QueryIntent::Command(_) => {
                return Err(
                    LanternError::validation("commands are not submittable queries").into(),
                );
            }
            QueryIntent::GenerateImage { prompt } => {
                if prompt.is_empty() {
                    return Err(LanternError::validation("image prompt is empty").into());
                }
                SubmissionMode::Image { prompt }
            }
            QueryIntent::Search { question } => SubmissionMode::Search { question },
        };

        self.generation += 1;
        self.state = SessionState::Loading;
        self.events.emit(
            "query_submitted",
            map_object(json!({
                "generation": self.generation,
                "mode": mode.label(),
                "text": mode.text(),
            })),
        )?;
        Ok(Submission {
            generation: self.generation,
            mode,
        })
    }

    /// Runs the submission's external calls and commits the outcome, unless
    /// a newer submission has started in the meantime. Results are applied
    /// in submission order, never completion order.
    pub fn resolve(&mut self, submission: Submission) -> Result<Resolution> {
        let outcome = match &submission.mode {
            SubmissionMode::Search { question } => self.run_search(question),
            SubmissionMode::Image { prompt } => self.run_image(prompt),
        };

        if submission.generation != self.generation {
            self.events.emit(
                "submission_superseded",
                map_object(json!({
                    "generation": submission.generation,
                    "current_generation": self.generation,
                })),
            )?;
            return Ok(Resolution::Superseded);
        }

        match outcome {
            Ok(state) => {
                match &state {
                    SessionState::Search(_) => self.searches += 1,
                    SessionState::Image(_) => self.images_generated += 1,
                    _ => {}
                }
                self.state = state.clone();
                Ok(Resolution::Committed(state))
            }
            Err(err) => {
                let message = error_chain_text(&err, 512);
                let kind = err
                    .downcast_ref::<LanternError>()
                    .map(LanternError::kind)
                    .unwrap_or("internal");
                self.errors += 1;
                self.state = SessionState::Error(message.clone());
                self.events.emit(
                    "submission_failed",
                    map_object(json!({
                        "generation": submission.generation,
                        "mode": submission.mode.label(),
                        "kind": kind,
                        "error": message,
                    })),
                )?;
                Err(err)
            }
        }
    }

    pub fn submit(&mut self, raw: &str) -> Result<Resolution> {
        let submission = self.begin(raw)?;
        self.resolve(submission)
    }

    fn run_search(&mut self, question: &str) -> Result<SessionState> {
        let sources = self.search.search(question)?;
        self.events.emit(
            "search_completed",
            map_object(json!({
                "question": question,
                "source_count": sources.len(),
            })),
        )?;

        let requested = self.text_model.clone();
        let selection = self.select_model(requested.as_deref(), "text")?;
        let model = selection.model.name;

        let answerer = Arc::clone(&self.answerer);
        let answer_model = model.clone();
        let answer_question = question.to_string();
        let answer_sources = sources.clone();
        let answer_handle = thread::Builder::new()
            .name("lantern-answer".to_string())
            .spawn(move || answerer.answer(&answer_model, &answer_question, &answer_sources))
            .context("failed to spawn answer worker")?;

        let topics_client = Arc::clone(&self.answerer);
        let topics_model = model.clone();
        let topics_question = question.to_string();
        let topics_handle = thread::Builder::new()
            .name("lantern-topics".to_string())
            .spawn(move || topics_client.related_topics(&topics_model, &topics_question))
            .context("failed to spawn topics worker")?;

        // Join both before inspecting either: the session is all-or-nothing.
        let answer_result = join_worker("answer", answer_handle);
        let topics_result = join_worker("topics", topics_handle);
        let answer = answer_result?;
        let similar_topics = topics_result?;

        self.events.emit(
            "answer_ready",
            map_object(json!({
                "model": model,
                "answer_chars": answer.chars().count(),
                "topic_count": similar_topics.len(),
            })),
        )?;

        Ok(SessionState::Search(SearchSession {
            question: question.to_string(),
            sources,
            answer,
            similar_topics,
        }))
    }

    fn run_image(&mut self, prompt: &str) -> Result<SessionState> {
        let requested = self.image_model.clone();
        let selection = self.select_model(requested.as_deref(), "image")?;
        let provider_name = selection.model.provider.clone();
        let request = ImageGenRequest {
            out_dir: self.out_dir.clone(),
            prompt: prompt.to_string(),
            model: selection.model.name.clone(),
        };
        let provider = self.image_providers.get(&provider_name).ok_or_else(|| {
            LanternError::validation(format!(
                "no image provider registered for '{provider_name}'"
            ))
        })?;
        let result = provider.generate(&request)?;
        self.events.emit(
            "image_generated",
            map_object(json!({
                "prompt": prompt,
                "model": request.model,
                "provider": provider_name,
                "artifact": result.artifact_path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(SessionState::Image(result))
    }

    /// Branches on the file's media type: images get a joint
    /// description + object-detection pass, text files a code explanation.
    /// A failed upload restores whatever was on screen before it.
    pub fn analyze_file(&mut self, path: &Path) -> Result<SessionState> {
        let previous = std::mem::replace(&mut self.state, SessionState::Loading);
        match self.run_analysis(path) {
            Ok(analysis) => {
                self.files_analyzed += 1;
                self.events.emit(
                    "file_analyzed",
                    map_object(json!({
                        "path": path.to_string_lossy().to_string(),
                        "kind": match &analysis {
                            FileAnalysisResult::Image { .. } => "image",
                            FileAnalysisResult::Code { .. } => "code",
                        },
                    })),
                )?;
                self.state = SessionState::File(analysis);
                Ok(self.state.clone())
            }
            Err(err) => {
                let message = error_chain_text(&err, 512);
                self.errors += 1;
                self.state = previous;
                self.events.emit(
                    "submission_failed",
                    map_object(json!({
                        "source": "file_upload",
                        "path": path.to_string_lossy().to_string(),
                        "error": message,
                    })),
                )?;
                Err(err)
            }
        }
    }

    fn run_analysis(&mut self, path: &Path) -> Result<FileAnalysisResult> {
        if !path.exists() {
            return Err(
                LanternError::validation(format!("file not found: {}", path.display())).into(),
            );
        }

        if image_mime_for_path(path).is_some() {
            let vision_model = self.select_model(None, "vision")?.model.name;
            let detection_model = self.select_model(None, "detection")?.model.name;

            let describe_client = Arc::clone(&self.inference);
            let describe_path = path.to_path_buf();
            let describe_handle = thread::Builder::new()
                .name("lantern-describe".to_string())
                .spawn(move || {
                    describe_client.describe_image(
                        &vision_model,
                        &describe_path,
                        DESCRIBE_IMAGE_PROMPT,
                    )
                })
                .context("failed to spawn describe worker")?;

            let detect_client = Arc::clone(&self.inference);
            let detect_path = path.to_path_buf();
            let detect_handle = thread::Builder::new()
                .name("lantern-detect".to_string())
                .spawn(move || detect_client.detect_objects(&detection_model, &detect_path))
                .context("failed to spawn detect worker")?;

            let describe_result = join_worker("describe", describe_handle);
            let detect_result = join_worker("detect", detect_handle);
            let description = describe_result?;
            let detected_objects = detect_result?;

            return Ok(FileAnalysisResult::Image {
                description,
                detected_objects,
            });
        }

        let bytes = fs::read(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let Ok(code) = String::from_utf8(bytes) else {
            return Err(LanternError::UnsupportedFile(path.to_path_buf()).into());
        };
        let code_model = self.select_model(None, "code")?.model.name;
        let explanation = self.inference.explain_code(&code_model, &code)?;
        Ok(FileAnalysisResult::Code { explanation })
    }

    /// Service-layer parity endpoint; classification never touches the
    /// session state.
    pub fn classify_file(&mut self, path: &Path) -> Result<Value> {
        if !path.exists() {
            return Err(
                LanternError::validation(format!("file not found: {}", path.display())).into(),
            );
        }
        if image_mime_for_path(path).is_none() {
            return Err(LanternError::UnsupportedFile(path.to_path_buf()).into());
        }
        let model = self.select_model(None, "classification")?.model.name;
        let labels = self.inference.classify_image(&model, path)?;
        Ok(labels)
    }

    /// Unconditionally back to `Idle`; any in-flight submission becomes
    /// stale and its resolution will be discarded.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.state = SessionState::Idle;
        let _ = self.events.emit("session_reset", EventPayload::new());
    }

    pub fn finish(&mut self) -> Result<()> {
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            searches: self.searches,
            images_generated: self.images_generated,
            files_analyzed: self.files_analyzed,
            errors: self.errors,
        };
        write_summary(&self.summary_path, &summary, None)?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "searches": self.searches,
                "images_generated": self.images_generated,
                "files_analyzed": self.files_analyzed,
                "errors": self.errors,
            })),
        )?;
        Ok(())
    }

    fn select_model(
        &mut self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection> {
        let selection = self
            .selector
            .select(requested, capability)
            .map_err(LanternError::Validation)?;
        self.last_fallback_reason = selection.fallback_reason.clone();
        if let Some(reason) = &selection.fallback_reason {
            self.events.emit(
                "model_fallback",
                map_object(json!({
                    "capability": capability,
                    "selected": selection.model.name,
                    "reason": reason,
                })),
            )?;
        }
        Ok(selection)
    }
}

fn join_worker<T>(
    name: &str,
    handle: thread::JoinHandle<std::result::Result<T, LanternError>>,
) -> Result<T> {
    match handle.join() {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => bail!("{name} worker panicked"),
    }
}

/// Grounding block of `title\nsnippet` per source, wrapped in the fixed
/// instruction template. Order is preserved; the block is capped so an
/// oversized source set cannot blow the model context window.
pub fn build_answer_prompt(question: &str, sources: &[SourceItem]) -> String {
    let grounding = sources
        .iter()
        .take(MAX_PROMPT_SOURCES)
        .map(|source| format!("{}\n{}", source.title, source.snippet))
        .collect::<Vec<String>>()
        .join("\n\n");
    let grounding = truncate_text(&grounding, MAX_GROUNDING_CHARS);
    format!("Based on these sources:\n\n{grounding}\n\nQuestion: {question}\n\nProvide a concise answer:")
}

/// Split on line breaks, drop blanks, strip a leading `N. ` numbering
/// prefix, trim. Tolerates any line count; non-numbered prose passes
/// through as plain lines.
pub fn parse_related_topics(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| strip_numbering(line).to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn strip_numbering(line: &str) -> &str {
    let trimmed = line.trim();
    let digits = trimmed
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .count();
    if digits > 0 {
        if let Some(rest) = trimmed[digits..].strip_prefix('.') {
            return rest.trim_start();
        }
    }
    trimmed
}

fn chat_message_content(
    provider: &str,
    payload: &Value,
) -> std::result::Result<String, LanternError> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            LanternError::external(provider, "response missing choices[0].message.content")
        })
}

/// Best-effort text extraction from a free-form inference payload; the
/// raw JSON is the fallback so nothing is silently dropped.
fn inference_text(payload: &Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    if let Some(rows) = payload.as_array() {
        if let Some(text) = rows
            .iter()
            .find_map(|row| row.get("generated_text").and_then(Value::as_str))
        {
            return text.to_string();
        }
    }
    if let Some(text) = payload.get("generated_text").and_then(Value::as_str) {
        return text.to_string();
    }
    payload.to_string()
}

fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> std::result::Result<Value, LanternError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        LanternError::external(provider, format!("response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(LanternError::external(
            provider,
            format!("request failed ({code}): {}", truncate_text(&body, 512)),
        ));
    }
    serde_json::from_str(&body)
        .map_err(|_| LanternError::external(provider, "returned invalid JSON payload"))
}

fn response_bytes_or_error(
    provider: &str,
    response: HttpResponse,
) -> std::result::Result<(Vec<u8>, Option<String>), LanternError> {
    let status = response.status();
    let code = status.as_u16();
    let mime = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(LanternError::external(
            provider,
            format!("request failed ({code}): {}", truncate_text(&body, 512)),
        ));
    }
    let bytes = response
        .bytes()
        .map_err(|err| {
            LanternError::external(provider, format!("response body read failed: {err}"))
        })?
        .to_vec();
    Ok((bytes, mime))
}

fn save_artifact(
    out_dir: &Path,
    prompt: &str,
    bytes: &[u8],
    ext: &str,
) -> std::result::Result<PathBuf, LanternError> {
    fs::create_dir_all(out_dir).map_err(|err| {
        LanternError::external(
            "huggingface",
            format!("failed to create {}: {err}", out_dir.display()),
        )
    })?;
    let stamp = timestamp_millis();
    let path = out_dir.join(format!(
        "artifact-{}-{}.{}",
        stamp,
        short_id(prompt, stamp as u64),
        ext
    ));
    fs::write(&path, bytes).map_err(|err| {
        LanternError::external(
            "huggingface",
            format!("failed to write {}: {err}", path.display()),
        )
    })?;
    Ok(path)
}

/// Inline data-URL form of a generated artifact, for front ends that
/// render images inline instead of by path.
pub fn image_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = image_mime_for_path(path).unwrap_or("image/jpeg");
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn vision_image_data_url(path: &Path) -> std::result::Result<String, LanternError> {
    let (bytes, mime) = prepare_vision_image(path, VISION_MAX_DIM).ok_or_else(|| {
        LanternError::validation(format!("could not read image {}", path.display()))
    })?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

/// Flatten alpha onto white, cap the longest edge and re-encode as JPEG
/// so the vision endpoint gets a bounded payload. Falls back to the raw
/// file bytes when decoding fails.
fn prepare_vision_image(path: &Path, max_dim: u32) -> Option<(Vec<u8>, String)> {
    let dim = max_dim.max(128);
    if let Ok(decoded) = image::open(path) {
        let rgba = decoded.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let resized = DynamicImage::ImageRgba8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8();
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder
            .encode_image(&DynamicImage::ImageRgb8(resized))
            .is_ok()
        {
            return Some((bytes, "image/jpeg".to_string()));
        }
    }

    let bytes = fs::read(path).ok()?;
    let mime = image_mime_for_path(path).unwrap_or("image/png").to_string();
    Some((bytes, mime))
}

pub fn image_mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "heic" | "heif" => Some("image/heic"),
        _ => None,
    }
}

fn extension_for_mime(mime: Option<&str>) -> &'static str {
    match mime.map(|value| value.split(';').next().unwrap_or(value).trim()) {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        _ => "jpg",
    }
}

fn write_dryrun_image(path: &Path, width: u32, height: u32, prompt: &str) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width, height);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    canvas
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn api_base_from_env(variable: &str, default: &str) -> String {
    env::var(variable)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
