//! redactd - redaction controller daemon
//!
//! This daemon:
//! 1. Parses the run configuration (detector config, input, output, annotations)
//! 2. Loads pipeline settings and the redaction policy
//! 3. Assembles the graph (simulated for `stub://` inputs, GStreamer otherwise)
//! 4. Runs until end of stream, a stream error, or Ctrl-C
//! 5. Exits 0 on a clean run, 1 on a bad command line, -1 on any other failure

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use redaction_kernel::{
    assemble, cli, Cli, Configuration, GraphRunner, LifecycleMachine, PipelineSettings,
    RedactionEngine, RunContext, RunReport, SimBackend, EXIT_FAILURE, EXIT_OK,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = cli::parse_exit_code(&err);
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let code = match run(args) {
        Ok(report) => {
            log::info!("run complete: {}", report);
            EXIT_OK
        }
        Err(err) => {
            log::error!("{:#}", err);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(args: Cli) -> Result<RunReport> {
    let mut settings = PipelineSettings::load()?;
    args.apply_overrides(&mut settings);
    let config = args.into_configuration(&settings)?;

    let policy = Arc::new(settings.load_policy()?);
    log::info!("suppressing classes {:?}", policy.suppressed_classes());
    if let Some(dir) = &config.annotation_dir {
        log::info!("writing annotations to {}", dir.display());
    }

    let context = Arc::new(RunContext::new());
    let engine = RedactionEngine::new(policy, Arc::clone(&context))
        .with_annotation_dir(config.annotation_dir.clone());
    let mut machine = LifecycleMachine::new(context);

    if config.input.is_synthetic() {
        let graph = assemble(&config, &settings, engine, SimBackend::for_settings(&settings))?;
        return drive(graph, &mut machine);
    }
    run_media(&config, &settings, engine, &mut machine)
}

fn drive<G: GraphRunner>(graph: G, machine: &mut LifecycleMachine) -> Result<RunReport> {
    let shutdown = graph.shutdown_handle();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, draining pipeline");
        shutdown.request();
    })?;

    log::info!("running");
    Ok(graph.run(machine)?.into_result()?)
}

#[cfg(feature = "gstreamer")]
fn run_media(
    config: &Configuration,
    settings: &PipelineSettings,
    engine: RedactionEngine,
    machine: &mut LifecycleMachine,
) -> Result<RunReport> {
    let backend = redaction_kernel::GstBackend::new(settings)?;
    let graph = assemble(config, settings, engine, backend)?;
    drive(graph, machine)
}

#[cfg(not(feature = "gstreamer"))]
fn run_media(
    config: &Configuration,
    _settings: &PipelineSettings,
    _engine: RedactionEngine,
    _machine: &mut LifecycleMachine,
) -> Result<RunReport> {
    Err(anyhow::anyhow!(
        "{:?} needs a media backend: rebuild with --features gstreamer or use a stub:// input",
        config.input
    ))
}
