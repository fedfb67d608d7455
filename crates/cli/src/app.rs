use std::{
    cell::{Cell, RefCell},
    io::{self, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use medgemma_config::{AppConfig, ConfigOverrides, LocalFileSystem, ModelResources};
use medgemma_core::{
    Assembler, Collaborators, DecodeOutcome, Engine, SpecialTokens, TextStreamer, TextTokenizer,
    TokenId,
    runtime::{device_label, prepare_device_and_dtype},
    vision::ImagePreprocessor,
};
use tracing::{info, warn};

use crate::{
    args::{Cli, Command, InferArgs, InspectArgs, LayoutArgs, TokenizeArgs},
    prompt::load_prompt,
    resources::{encode, load_tokenizer},
};

const APP_NAME: &str = "medgemma";

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Infer(args) => run_inference(args, cli.quiet),
        Command::Tokenize(args) => run_tokenize(args),
        Command::Layout(args) => run_layout(args),
        Command::Inspect(args) => run_inspect(args),
    }
}

fn load_config(
    fs: &LocalFileSystem,
    overrides: ConfigOverrides,
) -> Result<(AppConfig, ModelResources)> {
    let (config, descriptor, resources) = AppConfig::load_with_overrides(fs, overrides)?;
    info!(
        "Using configuration {} (active model `{}`)",
        descriptor.location.display_with(fs)?,
        config.models.active
    );
    Ok((config, resources))
}

pub fn run_inference(args: InferArgs, quiet: bool) -> Result<()> {
    let prompt = load_prompt(&args.prompt)?;

    let fs = LocalFileSystem::new(APP_NAME);
    let (app_config, resources) = load_config(&fs, ConfigOverrides::from(&args))?;
    let params = app_config.inference.decode_parameters();
    params.validate()?;

    let tokenizer = Arc::new(load_tokenizer(&fs, &resources.tokenizer)?);
    let (device, cache_dtype) =
        prepare_device_and_dtype(app_config.inference.device, app_config.inference.precision)?;
    info!(
        "Loading model `{}` (device={}, cache dtype={:?})",
        resources.id,
        device_label(&device),
        cache_dtype
    );

    let load_start = Instant::now();
    let collaborators = build_collaborators(
        &fs,
        &resources,
        tokenizer,
        app_config.engine.cache.num_layers,
        &device,
    )?;
    let engine = Engine::new(app_config.engine.clone(), collaborators, &device, cache_dtype)?;
    info!("Model ready in {:.2?}", load_start.elapsed());

    let image = args
        .image
        .as_deref()
        .map(ImagePreprocessor::open)
        .transpose()?;
    if image.is_none() {
        info!("No --image given, running a text-only request");
    }

    let streamer = RefCell::new(TextStreamer::new());
    let first_token_at = Cell::new(None::<Instant>);
    let stdout = RefCell::new(io::stdout());
    let on_token = |_count: usize, ids: &[TokenId]| {
        if first_token_at.get().is_none() {
            first_token_at.set(Some(Instant::now()));
        }
        match streamer.borrow_mut().push(engine.tokenizer(), ids, false) {
            Ok(delta) if !delta.is_empty() => {
                let mut handle = stdout.borrow_mut();
                let _ = write!(handle, "{delta}");
                let _ = handle.flush();
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to decode streamed tokens"),
        }
    };

    info!(
        "Starting generation with requested budget {} tokens",
        params.max_new_tokens
    );
    let gen_start = Instant::now();
    let outcome = engine
        .generate(
            &prompt,
            image.as_ref(),
            params,
            (!quiet).then_some(&on_token as &dyn Fn(usize, &[TokenId])),
        )
        .context("generation failed")?;
    let elapsed = gen_start.elapsed();

    if quiet {
        println!("{}", outcome.text);
    } else {
        let tail = streamer
            .borrow_mut()
            .push(engine.tokenizer(), &outcome.generated_tokens, true)?;
        let mut handle = stdout.borrow_mut();
        writeln!(handle, "{tail}")?;
        handle.flush()?;
    }

    info!("Stopped: {}", outcome.stop_reason);
    if outcome.stop_reason.is_budget_exceeded() {
        warn!("generation hit its budget before a stop token");
    }
    log_throughput(&outcome, elapsed, first_token_at.get().map(|t| t - gen_start));
    Ok(())
}

fn log_throughput(outcome: &DecodeOutcome, total: Duration, prefill: Option<Duration>) {
    let prefill = prefill.filter(|d| *d <= total).unwrap_or(total);
    let decode = total.checked_sub(prefill).unwrap_or_default();
    let rate = |count: usize, d: Duration| {
        let secs = d.as_secs_f64();
        if secs > 0.0 { count as f64 / secs } else { 0.0 }
    };
    info!(
        "Throughput: prefill={} tok in {:.2}s ({:.2} tok/s); generation={} tok in {:.2}s ({:.2} tok/s)",
        outcome.prompt_tokens,
        prefill.as_secs_f64(),
        rate(outcome.prompt_tokens, prefill),
        outcome.response_tokens,
        decode.as_secs_f64(),
        rate(outcome.response_tokens, decode),
    );
}

#[cfg(feature = "onnx")]
fn build_collaborators(
    fs: &LocalFileSystem,
    resources: &ModelResources,
    tokenizer: Arc<tokenizers::Tokenizer>,
    num_layers: usize,
    device: &candle_core::Device,
) -> Result<Collaborators> {
    crate::onnx::load_collaborators(fs, resources, tokenizer, num_layers, device)
}

#[cfg(not(feature = "onnx"))]
fn build_collaborators(
    _fs: &LocalFileSystem,
    _resources: &ModelResources,
    _tokenizer: Arc<tokenizers::Tokenizer>,
    _num_layers: usize,
    _device: &candle_core::Device,
) -> Result<Collaborators> {
    anyhow::bail!("this binary was built without the `onnx` feature; rebuild with `--features onnx`")
}

pub fn run_tokenize(args: TokenizeArgs) -> Result<()> {
    let fs = LocalFileSystem::new(APP_NAME);
    let (_, resources) = load_config(&fs, ConfigOverrides::from(&args.model))?;
    let tokenizer = load_tokenizer(&fs, &resources.tokenizer)?;
    let ids = encode(&tokenizer, &args.text)?;
    println!("{} tokens", ids.len());
    for id in ids {
        let piece = TextTokenizer::decode(&tokenizer, &[id]).unwrap_or_default();
        println!("{id:>8}  {piece:?}");
    }
    Ok(())
}

pub fn run_layout(args: LayoutArgs) -> Result<()> {
    let prompt = load_prompt(&args.prompt)?;
    let fs = LocalFileSystem::new(APP_NAME);
    let (app_config, resources) = load_config(&fs, ConfigOverrides::from(&args.model))?;
    let tokenizer = load_tokenizer(&fs, &resources.tokenizer)?;
    let engine_config = &app_config.engine;

    let special = SpecialTokens::resolve(&tokenizer, &engine_config.template)?;
    let prompt_ids = encode(&tokenizer, &prompt)?;
    let layout = Assembler::new(&special, engine_config.image_tokens)
        .layout(&prompt_ids, !args.no_image);

    println!("positions: {}", layout.token_ids.len());
    println!("bos: {}  image placeholder: {}", special.bos, special.image);
    match &layout.image_span {
        Some(span) => println!(
            "image features: positions {}..{} ({} rows)",
            span.start,
            span.end,
            span.len()
        ),
        None => println!("image features: none"),
    }
    let collapsed = collapse_runs(&layout.token_ids);
    println!("ids: {collapsed}");
    Ok(())
}

/// Render ids with runs of one id folded into `id x count`.
fn collapse_runs(ids: &[TokenId]) -> String {
    let mut parts = Vec::new();
    let mut iter = ids.iter().peekable();
    while let Some(&id) = iter.next() {
        let mut count = 1;
        while iter.peek() == Some(&&id) {
            iter.next();
            count += 1;
        }
        if count > 3 {
            parts.push(format!("{id}x{count}"));
        } else {
            parts.extend(std::iter::repeat_n(id.to_string(), count));
        }
    }
    parts.join(" ")
}

#[cfg(feature = "onnx")]
pub fn run_inspect(args: InspectArgs) -> Result<()> {
    crate::onnx::describe(&args.graph)
}

#[cfg(not(feature = "onnx"))]
pub fn run_inspect(args: InspectArgs) -> Result<()> {
    anyhow::bail!(
        "cannot inspect {}: this binary was built without the `onnx` feature",
        args.graph.display()
    )
}
