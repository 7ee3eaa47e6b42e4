use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use colored::Colorize;
use reqgraph::db::NewGroupRequest;
use reqgraph::export::{graph_to_dot, DotConfig, ExportFormat};
use reqgraph::import::TempUpload;
use reqgraph::serve::{start_server, AppState};
use reqgraph::{Config, Database, DbError};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "reqgraph")]
#[command(author, version, about = "Requirements management: projects, groups, linked requirements, history")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the JSON API server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Worker threads (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Manage user accounts
    #[command(subcommand)]
    User(UserCommand),

    /// Manage projects and their members
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage requirement groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Import requirements from a .csv, .xlsx or .xls file
    Import {
        file: PathBuf,

        #[arg(long)]
        project: i32,

        /// Target group for new requirements
        #[arg(long)]
        group: i32,

        /// Acting user
        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,
    },

    /// Export requirements as csv, xlsx or a DOT graph
    Export {
        /// Acting user
        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,

        /// Limit to one project
        #[arg(long)]
        project: Option<i32>,

        #[arg(short, long, value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Output file (stdout when omitted; required for xlsx)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include soft-deleted requirements
        #[arg(long)]
        include_deleted: bool,

        /// DOT only: keep these requirement ids and everything below them (comma separated)
        #[arg(long, value_delimiter = ',')]
        roots: Vec<String>,

        /// DOT only: graph direction
        #[arg(long, default_value = "TB")]
        rankdir: String,

        /// DOT only: cluster nodes by group
        #[arg(long)]
        cluster: bool,
    },

    /// Print a shell completion script
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create an account
    Add {
        username: String,

        #[arg(long)]
        password: String,

        #[arg(long)]
        email: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    /// Create a project owned by the acting user
    Add {
        name: String,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,
    },

    /// Add a member to a project
    Member {
        project_id: i32,

        username: String,

        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,
    },

    /// List projects the acting user belongs to
    List {
        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,
    },
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    /// Create a group in a project
    Add {
        project_id: i32,

        name: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Parent group id
        #[arg(long)]
        parent: Option<i32>,

        #[arg(long = "as", value_name = "USERNAME")]
        actor: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Csv,
    Xlsx,
    Dot,
}

fn init_logging(config: &Config, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.logging.filter.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = Config::load();
    init_logging(&config, cli.verbose);

    if let Err(e) = run(cli, config) {
        tracing::debug!(error = ?e, "command failed");
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn open_db(config: &Config) -> Result<Database, DbError> {
    Database::open_with(config.database_path(), config.database.busy_timeout_ms)
}

fn run(cli: Cli, mut config: Config) -> Result<(), DbError> {
    match cli.command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "reqgraph", &mut std::io::stdout());
            Ok(())
        }

        Command::Serve { port, host, workers } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            let db = open_db(&config)?;
            start_server(AppState { db, config })?;
            Ok(())
        }

        Command::User(UserCommand::Add {
            username,
            password,
            email,
        }) => {
            let db = open_db(&config)?;
            let user = db.register_user(&username, &password, email.as_deref())?;
            println!("{} Created user {} (id {})", "✓".green(), user.username.bold(), user.id);
            Ok(())
        }

        Command::Project(ProjectCommand::Add {
            name,
            description,
            actor,
        }) => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let project = db.create_project(&actor, &name, description.as_deref())?;
            println!("{} Created project {} (id {})", "✓".green(), project.name.bold(), project.id);
            Ok(())
        }

        Command::Project(ProjectCommand::Member {
            project_id,
            username,
            actor,
        }) => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let member = db.add_project_member(&actor, project_id, &username)?;
            println!("{} {} is a member of project {}", "✓".green(), member.username.bold(), project_id);
            Ok(())
        }

        Command::Project(ProjectCommand::List { actor }) => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let projects = db.list_projects(&actor)?;
            if projects.is_empty() {
                println!("{}", "No projects".dimmed());
            }
            for project in projects {
                println!(
                    "{:>4}  {}  {}",
                    project.id,
                    project.name.bold(),
                    project.description.unwrap_or_default().dimmed()
                );
            }
            Ok(())
        }

        Command::Group(GroupCommand::Add {
            project_id,
            name,
            description,
            parent,
            actor,
        }) => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let group = db.create_group(
                &actor,
                &NewGroupRequest {
                    project_id,
                    name,
                    description,
                    parent_id: parent,
                },
            )?;
            println!("{} Created group {} (id {})", "✓".green(), group.name.bold(), group.id);
            Ok(())
        }

        Command::Import {
            file,
            project,
            group,
            actor,
        } => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let upload = TempUpload::copy_from(&config.uploads.dir, &file)?;
            let summary = db.import_upload(&actor, project, group, upload)?;
            println!(
                "{} Imported {}: {} created, {} skipped, {} links",
                "✓".green(),
                file.display(),
                summary.processed,
                summary.skipped,
                summary.links_created
            );
            Ok(())
        }

        Command::Export {
            actor,
            project,
            format,
            output,
            include_deleted,
            roots,
            rankdir,
            cluster,
        } => {
            let db = open_db(&config)?;
            let actor = db.find_user(&actor)?;
            let bytes = match format {
                OutputFormat::Csv => ExportFormat::Csv.render(&db.export_rows(&actor, project, include_deleted)?)?,
                OutputFormat::Xlsx => {
                    if output.is_none() {
                        return Err(DbError::Validation("xlsx export needs --output".to_string()));
                    }
                    ExportFormat::Xlsx.render(&db.export_rows(&actor, project, include_deleted)?)?
                }
                OutputFormat::Dot => {
                    let mut view = db.graph_view(&actor, project, include_deleted)?;
                    if !roots.is_empty() {
                        let mut ids = Vec::new();
                        for root in &roots {
                            let node = view
                                .node_by_requirement_id(root.trim())
                                .ok_or_else(|| DbError::NotFound(format!("requirement '{}'", root)))?;
                            ids.push(node.id);
                        }
                        view = view.from_roots(&ids);
                    }
                    let dot_config = DotConfig {
                        title: None,
                        rankdir,
                        cluster_groups: cluster,
                    };
                    graph_to_dot(&view, &dot_config).into_bytes()
                }
            };

            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)?;
                    eprintln!("{} Wrote {}", "✓".green(), path.display());
                }
                None => std::io::stdout().write_all(&bytes)?,
            }
            Ok(())
        }
    }
}
