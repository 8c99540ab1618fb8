use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use codequill_core_sdk::{
    config::{Config, RepoOverrides},
    db, github,
    models::{self, ChangeProposal, CommitRequest, ModelConfig, RepoCoordinates, Role},
    orchestrator::Orchestrator,
    server, telemetry,
};

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const TITLE_MAX_CHARS: usize = 40;

/**
 * \brief CLI 程序入口：对话、确认提交与本地服务。
 */
#[derive(Parser, Debug)]
#[command(name = "codequill", version, about = "Chat with an LLM and commit the code it writes to GitHub")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/**
 * \brief 目标仓库覆盖参数，未提供时回退到环境配置。
 */
#[derive(Args, Debug, Default)]
struct RepoArgs {
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    branch: Option<String>,
}

impl From<RepoArgs> for RepoOverrides {
    fn from(args: RepoArgs) -> Self {
        RepoOverrides {
            owner: args.owner,
            repo: args.repo,
            branch: args.branch,
            token: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 列出可选模型。
     */
    Models,

    /**
     * \brief 发送一条消息；模型给出修改建议时可确认提交。
     */
    Chat {
        #[arg(long)]
        session: Option<i64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: String,
        /** \brief 附带仓库文件列表作为上下文。 */
        #[arg(long, default_value_t = false)]
        repo_context: bool,
        /** \brief 若有 COMMIT 建议，询问后提交。 */
        #[arg(long, default_value_t = false)]
        commit: bool,
        /** \brief 跳过确认。 */
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[command(flatten)]
        repo_args: RepoArgs,
    },

    /**
     * \brief 直接把本地文件提交到仓库路径。
     */
    Commit {
        #[arg(long)]
        path: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        message: String,
        #[command(flatten)]
        repo_args: RepoArgs,
    },

    /**
     * \brief 列出仓库文件。
     */
    Files {
        #[command(flatten)]
        repo_args: RepoArgs,
    },

    /**
     * \brief 列出历史会话。
     */
    Sessions,

    /**
     * \brief 显示会话全部发言。
     */
    Show {
        #[arg(long)]
        session: i64,
    },

    /**
     * \brief 最近提交记录。
     */
    Commits {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("load configuration failed")?;
    telemetry::init(config.telemetry_enabled, &config.log_dir);

    let conn = db::open_db(&config.db_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;

    let catalog = models::default_catalog();

    match cli.command {
        Commands::Models => {
            for m in &catalog {
                println!(
                    "{:<28} {:<10} {} - {}",
                    m.id, m.provider_kind, m.display_name, m.description
                );
            }
        }
        Commands::Chat {
            session,
            model,
            prompt,
            repo_context,
            commit,
            yes,
            repo_args,
        } => {
            let existing = match session {
                Some(id) => Some(
                    db::get_session(&conn, id)
                        .context("load session failed")?
                        .with_context(|| format!("session id={} not found", id))?,
                ),
                None => None,
            };
            let model_id = model
                .or_else(|| existing.as_ref().map(|s| s.model_id.clone()))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let model = resolve_model(&catalog, &model_id)?;

            let session_id = match existing {
                Some(s) => {
                    if s.model_id != model.id {
                        db::set_session_model(&conn, s.id, &model.id)
                            .context("update session model failed")?;
                    }
                    s.id
                }
                None => {
                    let id = db::create_session(&conn, &session_title(&prompt), &model.id)
                        .context("create session failed")?;
                    println!("Created session id={} (model={})", id, model.id);
                    id
                }
            };

            let history = db::load_turns(&conn, session_id).context("load history failed")?;
            let overrides: RepoOverrides = repo_args.into();
            let orchestrator = Orchestrator::new(&config);

            let files = if repo_context {
                match config.repo_coordinates(&overrides) {
                    Some(coords) => orchestrator.gateway().list_files(&coords).await,
                    None => {
                        eprintln!("repository not configured, continuing without file context");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "model={} session={} history={} prompt_len={} files={}",
                    model.id,
                    session_id,
                    history.len(),
                    prompt.len(),
                    files.len()
                ),
            );

            let response = orchestrator
                .converse_with_files(&history, &prompt, &model, &files)
                .await;

            db::append_turn(&conn, session_id, Role::User, &prompt, None)
                .context("insert user turn failed")?;
            db::append_turn(
                &conn,
                session_id,
                Role::Model,
                &response.text,
                response.structured_data.as_ref(),
            )
            .context("insert model turn failed")?;

            println!("{}", response.text);

            if let Some(proposal) = &response.structured_data {
                print_proposal(proposal);
                if commit && proposal.is_commit_ready() {
                    let coords = config
                        .repo_coordinates(&overrides)
                        .context("repository not configured: set GITHUB_OWNER and GITHUB_REPO or pass --owner/--repo")?;
                    if yes || confirm(proposal, &coords)? {
                        let request = proposal.to_commit_request()?;
                        let result = orchestrator
                            .confirm_and_commit(proposal, &coords)
                            .await
                            .context("commit failed")?;
                        db::record_commit(&conn, &request, &result)
                            .context("record commit failed")?;
                        println!("{} {}", result.operation.message(), result.html_url);
                    } else {
                        println!("Skipped commit.");
                    }
                }
            }
        }
        Commands::Commit {
            path,
            file,
            message,
            repo_args,
        } => {
            let new_content = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let coords = config
                .repo_coordinates(&repo_args.into())
                .context("repository not configured: set GITHUB_OWNER and GITHUB_REPO or pass --owner/--repo")?;
            let request = CommitRequest {
                file_path: path,
                new_content,
                commit_message: message,
            };
            let gateway = github::CommitGateway::new(&config);
            let result = gateway
                .commit(&request, &coords)
                .await
                .context("commit failed")?;
            db::record_commit(&conn, &request, &result).context("record commit failed")?;
            println!("{} {}", result.operation.message(), result.html_url);
        }
        Commands::Files { repo_args } => {
            let coords = config
                .repo_coordinates(&repo_args.into())
                .context("repository not configured: set GITHUB_OWNER and GITHUB_REPO or pass --owner/--repo")?;
            let files = github::CommitGateway::new(&config).list_files(&coords).await;
            for path in files {
                println!("{}", path);
            }
        }
        Commands::Sessions => {
            for s in db::list_sessions(&conn).context("list sessions failed")? {
                println!("{:>5}  {:<24} {}", s.id, s.model_id, s.title);
            }
        }
        Commands::Show { session } => {
            let turns = db::load_turns_with_meta(&conn, session).context("load turns failed")?;
            if turns.is_empty() {
                bail!("session id={} has no turns", session);
            }
            for turn in turns {
                println!("[{}] {}", turn.role.as_str(), turn.text);
                if let Some(proposal) = &turn.proposal {
                    print_proposal(proposal);
                }
            }
        }
        Commands::Commits { limit } => {
            for c in db::recent_commits(&conn, limit).context("load commits failed")? {
                println!(
                    "{}  {:<8} {}  \"{}\"  {}",
                    c.created_at, c.operation, c.file_path, c.commit_message, c.html_url
                );
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr, config).await?;
        }
    }

    Ok(())
}

fn resolve_model(catalog: &[ModelConfig], id: &str) -> Result<ModelConfig> {
    match models::find_model(catalog, id) {
        Some(m) => Ok(m.clone()),
        None => {
            let known = catalog
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            bail!("unknown model {} (available: {})", id, known)
        }
    }
}

fn session_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("").trim();
    let title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        "New session".to_string()
    } else {
        title
    }
}

fn print_proposal(proposal: &ChangeProposal) {
    println!("---");
    println!("proposal: {:?}", proposal.action);
    if let Some(path) = &proposal.file_path {
        println!("  file:    {}", path);
    }
    if let Some(msg) = &proposal.commit_message {
        println!("  message: {}", msg);
    }
    if let Some(content) = &proposal.new_content {
        println!("  content: {} lines", content.lines().count());
    }
    if proposal.preview_content.is_some() {
        println!("  preview: available");
    }
}

fn confirm(proposal: &ChangeProposal, coords: &RepoCoordinates) -> Result<bool> {
    print!(
        "Commit {} to {}/{}@{}? [y/N] ",
        proposal.file_path.as_deref().unwrap_or(""),
        coords.owner,
        coords.repo,
        coords.branch
    );
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read confirmation failed")?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
