use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::Result;
use std::path::PathBuf;
use tasklists::{Config, ListStore, Task, TaskList, seed};
use tracing::Level;

#[derive(Parser)]
#[command(name = "tasklists")]
#[command(about = "Personal task lists kept in a JSONL journal with an SQLite cache")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Directory holding the store (overrides the config file)
    #[arg(short, long)]
    store_path: Option<PathBuf>,

    /// Config file (default: <config dir>/tasklists/config.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show all lists with their progress
    Lists,

    /// Show a list's open and completed tasks
    Show {
        /// List id or exact title
        list: String,
    },

    /// Create, rename, delete or complete lists
    #[command(subcommand)]
    List(ListCommand),

    /// Add, edit, delete or toggle tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Insert the demo lists if the store is empty
    Seed,

    /// Rebuild the SQLite database from the JSONL files
    Sync,
}

#[derive(Subcommand)]
enum ListCommand {
    /// Create an empty list
    Add { title: String },

    /// Give a list a new title
    Rename { list: String, title: String },

    /// Delete a list and all of its tasks
    Delete { list: String },

    /// Mark every task in a list as done
    Done { list: String },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a task to a list
    Add {
        list: String,
        title: String,
        #[arg(short, long, default_value = "")]
        note: String,
        /// Insert at this position instead of appending
        #[arg(long)]
        at: Option<usize>,
    },

    /// Change a task's title and note
    Edit {
        /// Task id or unique id prefix
        task: String,
        title: String,
        /// New note (default: keep the current one)
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Delete a task
    Delete { task: String },

    /// Flip a task between done and not done
    Toggle { task: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let level = if cli.verbose { Level::DEBUG } else { config.level()? };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let store_path = cli.store_path.clone().unwrap_or_else(|| config.resolve_store_path());
    let mut store = ListStore::open(&store_path)?;

    if config.seed_on_first_run && !matches!(cli.command, Commands::Seed | Commands::Sync) {
        seed::seed_if_empty(&mut store)?;
    }

    match cli.command {
        Commands::Lists => print_lists(&store)?,
        Commands::Show { list } => {
            let list = store.find_list(&list)?;
            print_list(&store, &list)?;
        }
        Commands::List(command) => run_list_command(&mut store, command)?,
        Commands::Task(command) => run_task_command(&mut store, command)?,
        Commands::Seed => {
            let created = seed::seed_if_empty(&mut store)?;
            if created.is_empty() {
                println!("Store already has lists, nothing seeded");
            } else {
                println!("Seeded {} lists", created.len());
            }
        }
        Commands::Sync => {
            println!("Syncing database from JSONL files...");
            store.sync()?;
            println!("Sync complete");
        }
    }

    Ok(())
}

fn run_list_command(store: &mut ListStore, command: ListCommand) -> Result<()> {
    match command {
        ListCommand::Add { title } => {
            let list = store.save_list(&title)?;
            println!("Created {} {}", list.title.bold(), list.id.dimmed());
        }
        ListCommand::Rename { list, title } => {
            let list = store.find_list(&list)?;
            let renamed = store.rename_list(&list.id, &title)?;
            println!("Renamed {} to {}", list.title, renamed.title.bold());
        }
        ListCommand::Delete { list } => {
            let list = store.find_list(&list)?;
            store.delete_list(&list.id)?;
            println!("Deleted {} and its {} tasks", list.title, list.len());
        }
        ListCommand::Done { list } => {
            let list = store.find_list(&list)?;
            let changed = store.mark_list_done(&list.id)?;
            println!("Marked {} tasks done in {}", changed, list.title.bold());
        }
    }
    Ok(())
}

fn run_task_command(store: &mut ListStore, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add { list, title, note, at } => {
            let list = store.find_list(&list)?;
            let task = match at {
                Some(index) => store.insert_task(&list.id, index, &title, &note)?,
                None => store.save_task(&list.id, &title, &note)?,
            };
            println!("Added {} to {}", task.title.bold(), list.title);
        }
        TaskCommand::Edit { task, title, note } => {
            let current = store.find_task(&task)?;
            let note = note.unwrap_or(current.note);
            let task = store.edit_task(&current.id, &title, &note)?;
            print_task(&task);
        }
        TaskCommand::Delete { task } => {
            let task = store.find_task(&task)?;
            store.delete_task(&task.id)?;
            println!("Deleted {}", task.title);
        }
        TaskCommand::Toggle { task } => {
            let task = store.find_task(&task)?;
            let task = store.toggle_task_done(&task.id)?;
            print_task(&task);
        }
    }
    Ok(())
}

fn print_lists(store: &ListStore) -> Result<()> {
    let lists = store.lists()?;
    if lists.is_empty() {
        println!("No lists yet");
        return Ok(());
    }

    for list in &lists {
        let progress = if store.is_list_done(&list.id)? {
            "✓".green().to_string()
        } else {
            let open = store.tasks_in(&list.id, Some(false))?.len();
            format!("{} open", open).yellow().to_string()
        };
        println!(
            "{}  {}  {}  {}",
            list.title.bold(),
            progress,
            format_date(list.date).dimmed(),
            list.id.dimmed()
        );
    }
    Ok(())
}

fn print_list(store: &ListStore, list: &TaskList) -> Result<()> {
    println!("{}  {}", list.title.bold().underline(), format_date(list.date).dimmed());

    let open = store.tasks_in(&list.id, Some(false))?;
    let done = store.tasks_in(&list.id, Some(true))?;

    println!("\n{}", "Current tasks".bold());
    for task in &open {
        print_task(task);
    }

    println!("\n{}", "Completed tasks".bold());
    for task in &done {
        print_task(task);
    }
    Ok(())
}

fn print_task(task: &Task) {
    let title = if task.is_complete {
        task.title.green().strikethrough()
    } else {
        task.title.normal()
    };
    if task.note.is_empty() {
        println!("  {}  {}", title, task.id.dimmed());
    } else {
        println!("  {} ({})  {}", title, task.note.italic(), task.id.dimmed());
    }
}

fn format_date(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}
