use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use studydesk_core_sdk::{
    config::ServerConfig,
    db::{self, SqliteStore},
    llm::GenerationOptions,
    models::{AiConfigUpdate, Principal},
    normalize::{self, ChatPayload},
    server::{self, AppState},
    telemetry,
};

/**
 * \brief CLI 程序入口：服务启动、密钥轮换与本地开发辅助命令。
 */
#[derive(Parser, Debug)]
#[command(name = "studydesk", version, about = "StudyDesk backend")]
struct Cli {
    /** \brief 覆盖 STUDYDESK_DB_PATH */
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务（API + 静态站点）。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /**
     * \brief 加密保存 AI 密钥，可同时更新 provider/model。
     */
    SetKey {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /** \brief 写入审计字段的操作者 */
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /**
     * \brief 显示当前 AI 配置摘要。
     */
    ShowConfig,

    /**
     * \brief 为用户授予管理员角色（仅本地存储）。
     */
    GrantAdmin {
        #[arg(long)]
        user_id: String,
    },

    /**
     * \brief 登记本地访问 token（仅本地存储，开发用）。
     */
    IssueToken {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        email: Option<String>,
    },

    /**
     * \brief 发送一条消息并打印模型回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        temperature: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().context("read configuration failed")?;
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }
    telemetry::set_event_log(config.log_file.clone().map(Into::into));

    match cli.command {
        Commands::Serve { addr } => {
            server::run(config, &addr).await?;
        }
        Commands::SetKey {
            api_key,
            provider,
            model,
            actor,
        } => {
            let state = AppState::from_config(&config)?;
            let key_given = api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
            let actor = Principal {
                id: actor,
                ..Default::default()
            };
            let summary = state
                .secrets
                .save_config(
                    AiConfigUpdate {
                        api_key,
                        provider,
                        model,
                    },
                    &actor,
                )
                .await
                .context("save ai config failed")?;
            tracing::info!(
                actor = %summary.updated_by.as_deref().unwrap_or("-"),
                rotated = key_given,
                "ai config saved from cli"
            );
            println!(
                "Saved AI config ({} | {} | key {})",
                summary.provider,
                summary.model,
                summary.key_preview.as_deref().unwrap_or("-")
            );
        }
        Commands::ShowConfig => {
            let state = AppState::from_config(&config)?;
            let summary = state
                .secrets
                .summary()
                .await
                .context("load ai config failed")?;
            println!("{}", serde_json_pretty(&summary)?);
        }
        Commands::GrantAdmin { user_id } => {
            let store = local_store(&config)?;
            store.with_conn(|conn| db::grant_role(conn, &user_id, "admin"))?;
            tracing::info!(user = %user_id, "admin role granted");
            println!("Granted admin to {}", user_id);
        }
        Commands::IssueToken {
            token,
            user_id,
            email,
        } => {
            let store = local_store(&config)?;
            let principal = Principal {
                id: user_id.clone(),
                email,
                ..Default::default()
            };
            store.with_conn(|conn| db::insert_token(conn, &token, &principal))?;
            println!("Issued token for {}", user_id);
        }
        Commands::Chat {
            prompt,
            temperature,
        } => {
            let state = AppState::from_config(&config)?;
            let payload = ChatPayload {
                message: Some(prompt.into()),
                temperature,
                ..Default::default()
            };
            let request = normalize::build_chat_request(&payload)?;
            let credentials = state.secrets.require().await?;
            let reply = state
                .upstream
                .generate(
                    &credentials.api_key,
                    &credentials.model,
                    &request,
                    GenerationOptions::default().with_temperature(temperature),
                )
                .await
                .context("chat request failed")?;
            tracing::debug!(
                model = %credentials.model,
                reply_len = reply.len(),
                "chat reply received"
            );
            println!("{}", reply);
        }
    }

    Ok(())
}

fn local_store(config: &ServerConfig) -> Result<SqliteStore> {
    if config.remote_store.is_some() {
        bail!("this command only works with the local SQLite store; unset STUDYDESK_STORE_URL");
    }
    SqliteStore::open(&config.db_path)
}

fn serde_json_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
