use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use medgemma_config::ConfigOverrides;
use medgemma_core::runtime::{DeviceKind, Precision};

#[derive(Parser, Debug)]
#[command(author, version, about = "MedGemma multimodal report generator", long_about = None)]
pub struct Cli {
    /// Only log errors; generated text is printed once at the end.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a report for an image and a prompt, streaming tokens to stdout.
    Infer(InferArgs),
    /// Print the token ids the tokenizer produces for some text.
    Tokenize(TokenizeArgs),
    /// Show the assembled prompt layout and where image features are spliced in.
    Layout(LayoutArgs),
    /// List the inputs and outputs of an exported ONNX graph.
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Select which model entry to load from the configuration.
    #[arg(long, value_name = "ID", help_heading = "Application")]
    pub model: Option<String>,

    /// Directory holding the exported graphs and tokenizer.json.
    #[arg(long, value_name = "DIR", help_heading = "Application")]
    pub model_dir: Option<PathBuf>,

    /// Override the default tokenizer path.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub tokenizer: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PromptArgs {
    /// Prompt text.
    #[arg(long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// Prompt file path (UTF-8). Overrides `--prompt` when provided.
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    pub prompt_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InferArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub prompt: PromptArgs,

    /// Image to describe. Without it the request is text-only.
    #[arg(long, value_name = "PATH")]
    pub image: Option<PathBuf>,

    /// Device backend to execute on (cpu/metal/cuda).
    #[arg(long, help_heading = "Inference")]
    pub device: Option<DeviceKind>,

    /// Element type of the key/value cache. Defaults to f32.
    #[arg(long, help_heading = "Inference")]
    pub dtype: Option<Precision>,

    /// Maximum number of tokens to generate.
    #[arg(long, help_heading = "Inference")]
    pub max_new_tokens: Option<usize>,

    /// Sampling temperature (> 0).
    #[arg(long, help_heading = "Inference")]
    pub temperature: Option<f64>,

    /// Nucleus probability mass in (0, 1].
    #[arg(long, help_heading = "Inference")]
    pub top_p: Option<f64>,

    /// Penalty for recently generated tokens (1.0 disables it).
    #[arg(long, help_heading = "Inference")]
    pub repetition_penalty: Option<f32>,

    /// How many recent tokens the repetition penalty considers.
    #[arg(long, help_heading = "Inference")]
    pub repetition_window: Option<usize>,

    /// Seed for reproducible sampling.
    #[arg(long, help_heading = "Inference")]
    pub seed: Option<u64>,

    /// Submit the prompt to the decoder in chunks of this many positions.
    #[arg(long, help_heading = "Inference")]
    pub prefill_chunk: Option<usize>,

    /// Stop after this many seconds of decoding.
    #[arg(long, value_name = "SECS", help_heading = "Inference")]
    pub time_budget: Option<u64>,

    /// Stop once the output contains this exact string (repeatable).
    #[arg(long = "stop", value_name = "TEXT", help_heading = "Inference")]
    pub stop_strings: Vec<String>,

    /// Stop once the output contains this phrase, ignoring case, spaces and punctuation
    /// (repeatable). Replaces the configured report trailers.
    #[arg(long = "stop-phrase", value_name = "TEXT", help_heading = "Inference")]
    pub normalized_stop_strings: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TokenizeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Text to encode.
    pub text: String,
}

#[derive(Args, Debug)]
pub struct LayoutArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub prompt: PromptArgs,

    /// Lay out a text-only request.
    #[arg(long)]
    pub no_image: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to an `.onnx` graph.
    pub graph: PathBuf,
}

impl From<&ModelArgs> for ConfigOverrides {
    fn from(args: &ModelArgs) -> Self {
        ConfigOverrides {
            config_path: args.config.clone(),
            model_id: args.model.clone(),
            model_dir: args.model_dir.clone(),
            tokenizer: args.tokenizer.clone(),
            ..ConfigOverrides::default()
        }
    }
}

impl From<&InferArgs> for ConfigOverrides {
    fn from(args: &InferArgs) -> Self {
        let mut overrides = ConfigOverrides::from(&args.model);
        let inference = &mut overrides.inference;
        inference.device = args.device;
        inference.precision = args.dtype;
        inference.max_new_tokens = args.max_new_tokens;
        inference.temperature = args.temperature;
        inference.top_p = args.top_p;
        inference.repetition_penalty = args.repetition_penalty;
        inference.repetition_window = args.repetition_window;
        inference.seed = args.seed;
        inference.prefill_chunk = args.prefill_chunk;
        inference.time_budget_secs = args.time_budget;
        inference.stop_strings = args.stop_strings.clone();
        inference.normalized_stop_strings = args.normalized_stop_strings.clone();
        overrides
    }
}
