use clap::Parser;
use log::{debug, info};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use debug_assist::
{   AssistConfig
  , CanonicalRequest
  , Error
  , MemoryCredentials
  , ProviderId
  , ProviderManager
};

/// Ask an AI backend about a runtime error.
#[derive(Debug, Parser)]
#[command(name = "debug-assist", version)]
struct Args
{   /// The question to ask
    question: String

  , /// JSON configuration file; built-in defaults when absent
    #[arg(long)]
    config: Option<PathBuf>

  , /// Provider to start with (anthropic, openai, gemini, ollama)
    #[arg(long)]
    provider: Option<ProviderId>

  , /// Print the answer as it arrives
    #[arg(long)]
    stream: bool

  , #[arg(long, default_value = "Runtime Error")]
    error_type: String

  , #[arg(long, default_value = "")]
    error_message: String

  , /// Source file the error came from; also keys the conversation
    #[arg(long, default_value = "unknown")]
    file: String

  , /// Code surrounding the error
    #[arg(long, default_value = "")]
    code: String
}

#[tokio::main]
async fn main() -> Result<(), Error>
{   env_logger::init();
    let args = Args::parse();

    let config = match &args.config
    {   Some(path) => AssistConfig::load(path)?
      , None => AssistConfig::default()
    };
    debug!("Loaded configuration: {:?}", config.manager);

    let credentials = Arc::new(MemoryCredentials::from_env());
    let manager = ProviderManager::from_config(&config, credentials)?;
    manager.initialize().await;
    if let Some(id) = args.provider
    {   manager.switch_provider(id).await?;
    }

    let request = CanonicalRequest::new(
      args.question
    , args.code
    , args.error_message
    , args.file
    , args.error_type
    );

    let response = if args.stream
    {   let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
          if tokio::signal::ctrl_c().await.is_ok()
          {   on_interrupt.cancel();
          }
        });
        let mut stdout = std::io::stdout();
        let mut print_chunk = |chunk: &str| {
          let _ = write!(stdout, "{}", chunk);
          let _ = stdout.flush();
        };
        let response = manager
          .send_request_streaming(&request, &mut print_chunk, &cancel)
          .await;
        println!();
        response
    } else
    {   let response = manager.send_request(&request).await;
        if response.success
        {   println!("{}", response.text);
        }
        response
    };

    info!(
      "{} answered in {} ms ({} tokens)",
      response.provider_id, response.response_time_ms, response.token_usage.total
    );
    manager.dispose();

    if let Some(error) = &response.error
    {   eprintln!("error: {}", error);
        std::process::exit(1);
    }
    Ok(())
}
