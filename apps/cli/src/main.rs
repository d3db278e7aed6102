use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use finass_core_sdk::{
    config::RelayConfig,
    models::{AssistantConfig, ChatMessage, ChatTurn, Role},
    registry::AssistantRegistry,
    relay::ConversationRelay,
    server, telemetry,
    upstream::OpenAiAssistants,
};

/**
 * \brief FinAss 命令行入口。
 */
#[derive(Parser, Debug)]
#[command(name = "finass", version, about = "FinAss financial assistant relay")]
struct Cli {
    /** \brief 覆盖 FINASS_API_BASE */
    #[arg(long, global = true)]
    api_base: Option<String>,
    /** \brief 覆盖 FINASS_MODEL */
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    enable_telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief 发送一条消息并流式显示助手回复。
     * \param thread_id 复用的线程 ID
     * \param file_id   已上传文件 ID，可重复
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long = "file-id")]
        file_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::from_env().context("load configuration failed")?;
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    if cli.enable_telemetry {
        config.telemetry_enabled = true;
    }
    telemetry::init(config.telemetry_enabled, &config.log_dir);

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr, &config).await?;
        }
        Commands::Chat {
            prompt,
            thread_id,
            file_ids,
        } => {
            let api = OpenAiAssistants::from_config(&config).context("build client failed")?;
            let registry = AssistantRegistry::new(AssistantConfig::financial(&config.model));
            let relay = ConversationRelay::new(Arc::new(api), Arc::new(registry));

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "thread={:?} files={} prompt_len={}",
                    thread_id,
                    file_ids.len(),
                    prompt.len()
                ),
            );

            let turn = ChatTurn {
                messages: vec![ChatMessage {
                    id: "1".to_string(),
                    role: Role::User,
                    content: prompt,
                }],
                thread_id,
                file_ids,
            };
            let mut resp = relay.handle(turn).await.context("chat request failed")?;
            eprintln!("thread: {}", resp.thread_id);

            let mut stdout = std::io::stdout();
            while let Some(Ok(chunk)) = resp.body.next().await {
                stdout.write_all(&chunk)?;
                stdout.flush().ok();
            }
            println!();
        }
    }

    Ok(())
}
