//! second-brain-capture: file a thought from the terminal
//!
//! Sends one capture to the classification backend, prints progress while it
//! streams, and prompts on stdin when the backend asks for a bucket or a
//! clarification.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use second_brain_capture::capture::{CaptureRequest, FollowUpReply};
use second_brain_capture::config::{Config, Protocol};
use second_brain_capture::events::{CaptureEvent, WorkflowEvent};
use second_brain_capture::lifecycle::ShutdownSignal;
use second_brain_capture::state::{CaptureWorkflow, WorkflowError, WorkflowState};
use second_brain_capture::stream::HttpTransport;

#[derive(Debug, Parser)]
#[command(name = "second-brain-capture", version, about = "Capture a thought into your second brain")]
struct Args {
    /// Text to capture; read from stdin when omitted
    text: Vec<String>,

    /// Upload a recorded audio file instead of text
    #[arg(long, value_name = "FILE", conflicts_with = "text")]
    voice: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Use the legacy /api/ag-ui endpoints
    #[arg(long)]
    legacy: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // logs go to stderr so stdout only carries the outcome
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(api_url) = args.api_url {
        config.api_url = api_url.trim_end_matches('/').to_string();
    }
    if args.legacy {
        config.protocol = Protocol::Legacy;
    }
    info!(api_url = %config.api_url, protocol = ?config.protocol, "configuration loaded");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let request = match args.voice {
        Some(path) => {
            let audio = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            CaptureRequest::voice(audio)
        }
        None if !args.text.is_empty() => CaptureRequest::text(args.text.join(" ")),
        None => {
            let mut text = String::new();
            stdin
                .read_to_string(&mut text)
                .await
                .context("failed to read capture from stdin")?;
            CaptureRequest::text(text)
        }
    };

    let transport = HttpTransport::new(&config).context("failed to build HTTP client")?;
    let (event_tx, _) = broadcast::channel::<WorkflowEvent>(64);
    let mut workflow = CaptureWorkflow::new(transport, &config, event_tx);

    let progress = tokio::spawn(print_progress(workflow.subscribe()));
    let mut shutdown = ShutdownSignal::new().context("failed to install signal handlers")?;
    let mut prompts = stdin.lines();

    workflow.submit(request)?;

    let code = 'session: loop {
        let interrupted = tokio::select! {
            _ = workflow.run_until_settled() => false,
            result = shutdown.wait() => {
                result.context("failed to listen for signals")?;
                true
            }
        };
        if interrupted {
            info!("interrupted, cancelling capture");
            workflow.cancel();
            break ExitCode::from(130);
        }

        match workflow.state().clone() {
            WorkflowState::Succeeded { result, .. } => {
                println!("{result}");
                break ExitCode::SUCCESS;
            }
            WorkflowState::Unresolved { .. } => {
                println!("Couldn't classify this one. It is waiting in your inbox.");
                break ExitCode::SUCCESS;
            }
            WorkflowState::Failed(failure) => {
                warn!(detail = %failure.detail, "capture failed");
                println!("{}", failure.user_message());
                break ExitCode::FAILURE;
            }
            WorkflowState::AwaitingBucketChoice(choice) => {
                if let Some(question) = &choice.question {
                    println!("{question}");
                }
                if !choice.suggested.is_empty() {
                    println!("Suggested: {}", choice.suggested.join(", "));
                }
                let label = format!("Bucket [{}]", workflow.buckets().join("/"));
                loop {
                    let answer = match prompt(&mut prompts, &label, &mut shutdown).await? {
                        Input::Line(answer) => answer,
                        Input::Closed => {
                            println!("No bucket chosen. It is waiting in your inbox.");
                            break 'session ExitCode::SUCCESS;
                        }
                        Input::Interrupted => break 'session ExitCode::from(130),
                    };
                    match workflow.choose_bucket(&answer) {
                        Ok(_) => break,
                        Err(WorkflowError::UnknownBucket(bucket)) => {
                            println!("Unknown bucket {bucket:?}");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            WorkflowState::AwaitingFollowUp(follow_up) => {
                println!("{}: {}", follow_up.round_label(), follow_up.question);
                let answer = match prompt(&mut prompts, "Reply", &mut shutdown).await? {
                    Input::Line(answer) => answer,
                    Input::Closed => {
                        println!("No reply given. It is waiting in your inbox.");
                        break ExitCode::SUCCESS;
                    }
                    Input::Interrupted => break ExitCode::from(130),
                };
                workflow.submit_follow_up(FollowUpReply::Text(answer))?;
            }
            other => {
                warn!(state = %other, "workflow stopped unexpectedly");
                break ExitCode::FAILURE;
            }
        }
    };

    progress.abort();
    Ok(code)
}

enum Input {
    Line(String),
    /// End of input or an empty answer
    Closed,
    Interrupted,
}

/// Read one answer, giving up on a shutdown signal
async fn prompt(
    lines: &mut Lines<BufReader<Stdin>>,
    label: &str,
    shutdown: &mut ShutdownSignal,
) -> Result<Input> {
    eprint!("{label}: ");
    tokio::select! {
        line = lines.next_line() => {
            let line = line.context("failed to read stdin")?;
            Ok(match line.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) {
                Some(answer) => Input::Line(answer),
                None => Input::Closed,
            })
        }
        result = shutdown.wait() => {
            result.context("failed to listen for signals")?;
            info!("interrupted at prompt");
            Ok(Input::Interrupted)
        }
    }
}

async fn print_progress(mut events: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkflowEvent::Capture { event }) => match event {
                CaptureEvent::StepStarted { step } => eprintln!("... {step}"),
                CaptureEvent::TextDelta { delta } => eprint!("{delta}"),
                _ => {}
            },
            Ok(WorkflowEvent::StateChanged { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "progress receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
