use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;

use lattice::core::{ExecutionPlan, GenreId, ProjectId, Readiness, TaskId};
use lattice::orchestration::orchestrator::EngineEvent;
use lattice::orchestration::{
    CommandMap, EngineHandle, ProjectCoordinator, RunState, ShellExecutor,
};
use lattice::sync::stream::StreamPayload;
use lattice::{llog, EngineConfig, Error, Result};

/// lattice - task dependency orchestration engine
#[derive(Parser, Debug)]
#[command(name = "lattice")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    LATTICE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.lattice/lattice.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the computed execution plan for a project file
    Plan {
        /// Path to the project TOML file
        file: PathBuf,
    },

    /// Execute a project file, running each task's shell command
    Run {
        /// Path to the project TOML file
        file: PathBuf,

        /// Maximum number of tasks running at once
        #[arg(long, short = 'j')]
        limit: Option<usize>,
    },
}

/// On-disk project description.
#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    genres: Vec<GenreSpec>,
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
struct GenreSpec {
    name: String,
    #[serde(default = "default_color")]
    color: String,
}

fn default_color() -> String {
    "#888888".to_string()
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    /// Slug other tasks reference in their depends_on lists.
    id: String,
    title: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    genre: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    lattice::log::init(cli.debug);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Command::Plan { file } => plan(&file).await,
            Command::Run { file, limit } => run(&file, limit).await,
        }
    })
}

fn load_project(path: &PathBuf) -> Result<ProjectFile> {
    let raw = std::fs::read_to_string(path)?;
    let project: ProjectFile = toml::from_str(&raw)?;
    if project.tasks.is_empty() {
        return Err(Error::Validation(format!(
            "{} defines no tasks",
            path.display()
        )));
    }
    Ok(project)
}

fn engine_config(limit: Option<usize>) -> Result<EngineConfig> {
    let mut config = EngineConfig::load()?;
    if let Some(limit) = limit {
        if limit == 0 {
            return Err(Error::Validation(
                "concurrency limit must be a positive integer".to_string(),
            ));
        }
        config.concurrency_limit = limit;
    }
    Ok(config)
}

/// Create the project's genres, tasks, and edges through the engine.
/// Fills `commands` so the executor can resolve work, and returns the
/// slug-to-id table for display.
async fn populate(
    handle: &EngineHandle,
    project: &ProjectFile,
    commands: &CommandMap,
) -> Result<HashMap<String, TaskId>> {
    let mut genre_ids: HashMap<String, GenreId> = HashMap::new();
    for spec in &project.genres {
        let genre = handle.add_genre(&spec.name, &spec.color).await?;
        genre_ids.insert(spec.name.clone(), genre.id);
    }

    let mut task_ids: HashMap<String, TaskId> = HashMap::new();
    for spec in &project.tasks {
        let title = spec.title.as_deref().unwrap_or(&spec.id);
        let task = handle.create_task(title, None).await?;
        task_ids.insert(spec.id.clone(), task.id);
        if let Some(command) = &spec.command {
            if let Ok(mut map) = commands.write() {
                map.insert(task.id, command.clone());
            }
        }
    }

    for spec in &project.tasks {
        let task_id = task_ids[&spec.id];
        let genre_id = spec
            .genre
            .as_ref()
            .and_then(|name| genre_ids.get(name))
            .copied();
        for dep in &spec.depends_on {
            let depends_on_id = *task_ids.get(dep).ok_or_else(|| {
                Error::Validation(format!(
                    "task '{}' depends on unknown task '{}'",
                    spec.id, dep
                ))
            })?;
            handle.add_edge(task_id, depends_on_id, genre_id).await?;
        }
    }

    Ok(task_ids)
}

fn print_plan(plan: &ExecutionPlan, titles: &HashMap<TaskId, String>) {
    for (depth, level) in plan.levels.iter().enumerate() {
        println!("level {}:", depth);
        for entry in level {
            let title = titles
                .get(&entry.task_id)
                .map(String::as_str)
                .unwrap_or("<unknown>");
            let readiness = match &entry.readiness {
                Readiness::Ready => "ready".to_string(),
                Readiness::Blocked { blocking_task_ids } => {
                    format!("blocked by {} task(s)", blocking_task_ids.len())
                }
                Readiness::InProgress => "in progress".to_string(),
                Readiness::Completed => "completed".to_string(),
                Readiness::Cancelled => "cancelled".to_string(),
            };
            println!("  {:<32} {}", title, readiness);
        }
    }
}

fn slug_titles(task_ids: &HashMap<String, TaskId>) -> HashMap<TaskId, String> {
    task_ids
        .iter()
        .map(|(slug, id)| (*id, slug.clone()))
        .collect()
}

async fn plan(file: &PathBuf) -> Result<()> {
    let project = load_project(file)?;

    let commands = CommandMap::default();
    let (report_tx, report_rx) = mpsc::channel(64);
    let executor = Arc::new(ShellExecutor::new(Arc::clone(&commands), report_tx));
    let (handle, _join) = ProjectCoordinator::spawn(
        ProjectId::new(),
        engine_config(None)?,
        executor,
        report_rx,
        None,
    );

    let task_ids = populate(&handle, &project, &commands).await?;
    let titles = slug_titles(&task_ids);

    let status = handle.status().await?;
    if let Some(name) = &project.name {
        println!("{}", name);
    }
    print_plan(&status.plan, &titles);
    handle.shutdown().await;
    Ok(())
}

async fn run(file: &PathBuf, limit: Option<usize>) -> Result<()> {
    let project = load_project(file)?;

    let commands = CommandMap::default();
    let (report_tx, report_rx) = mpsc::channel(64);
    let executor = Arc::new(ShellExecutor::new(Arc::clone(&commands), report_tx));
    let (handle, _join) = ProjectCoordinator::spawn(
        ProjectId::new(),
        engine_config(limit)?,
        executor,
        report_rx,
        None,
    );

    let task_ids = populate(&handle, &project, &commands).await?;
    let titles = slug_titles(&task_ids);
    llog!("running {} tasks from {}", titles.len(), file.display());

    let mut client = handle.subscribe().await?;
    handle.start().await?;

    loop {
        let msg = client
            .next_timeout(tokio::time::Duration::from_secs(600))
            .await?;
        client.apply(&msg)?;
        let StreamPayload::Event(event) = &msg.payload else {
            continue;
        };
        match event {
            EngineEvent::TaskStarted { task_id } => {
                println!("started   {}", label(&titles, *task_id));
            }
            EngineEvent::TaskCompleted { task_id } => {
                println!("completed {}", label(&titles, *task_id));
            }
            EngineEvent::TaskFailed { task_id, error } => {
                println!("failed    {} ({})", label(&titles, *task_id), error);
            }
            EngineEvent::TaskAwaitingReview { task_id } => {
                println!("review    {}", label(&titles, *task_id));
            }
            EngineEvent::Diagnostic { message } => {
                eprintln!("diagnostic: {}", message);
            }
            EngineEvent::StateChanged { state } => {
                println!("run state: {}", state);
                if *state == RunState::Idle {
                    break;
                }
            }
            EngineEvent::PlanUpdated { .. } => {}
        }
    }

    let status = handle.status().await?;
    print_plan(&status.plan, &titles);
    handle.shutdown().await;
    Ok(())
}

fn label(titles: &HashMap<TaskId, String>, task_id: TaskId) -> String {
    titles
        .get(&task_id)
        .cloned()
        .unwrap_or_else(|| task_id.short())
}
