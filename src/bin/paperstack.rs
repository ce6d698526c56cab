use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use paperstack::api::{CrossrefProvider, NoProgress, PaperProvider};
use paperstack::app::App;
use paperstack::cache::ResponseCache;
use paperstack::db::Database;
use paperstack::domain::Doi;
use paperstack::error::PaperError;
use paperstack::output::{
    BOLD, CYAN, ConsoleOutput, GREEN, JsonOutput, OutputMode, RESET, TermProgress,
};
use paperstack::registry::CrossrefHttpClient;

#[derive(Parser)]
#[command(name = "paperstack")]
#[command(about = "Catalogue papers by DOI, with enriched citations and Markdown notes")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Machine-readable output")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a paper by DOI and add it to the catalogue")]
    Add { doi: String },
    #[command(about = "Regenerate the note file for a catalogued paper")]
    Note { doi: String },
    #[command(about = "Write note front matter back into the database")]
    Sync { doi: String },
    #[command(about = "Remove a paper from the database (the note file is kept)")]
    Remove { doi: String },
    #[command(about = "List catalogued papers")]
    List,
    #[command(about = "Show candidate author entries matching a name")]
    Authors { name: String },
    #[command(about = "Show or set the notes directory")]
    Config {
        #[arg(long)]
        folder: Option<String>,
    },
    #[command(about = "Drop the cached registry response for a DOI")]
    PurgeCache { doi: String },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PaperError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PaperError) -> u8 {
    match error {
        PaperError::WorkNotFound(_)
        | PaperError::PaperNotFound(_)
        | PaperError::NoteNotFound(_) => 2,
        PaperError::CrossrefHttp(_)
        | PaperError::CrossrefStatus { .. }
        | PaperError::CrossrefDecode(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Interactive
    };

    let db = Arc::new(Database::open_default().into_diagnostic()?);
    let client = CrossrefHttpClient::new().into_diagnostic()?;
    let provider =
        CrossrefProvider::new(client, Arc::clone(&db) as Arc<dyn ResponseCache>);
    let app = App::new(db, provider);

    match cli.command {
        Commands::Add { doi } => run_add(&app, &doi, output_mode),
        Commands::Note { doi } => run_note(&app, &doi, output_mode),
        Commands::Sync { doi } => run_sync(&app, &doi, output_mode),
        Commands::Remove { doi } => {
            let doi = parse_doi(&doi)?;
            app.remove(&doi).into_diagnostic()?;
            if matches!(output_mode, OutputMode::Interactive) {
                eprintln!("removed paper from the database, keeping the note file");
            }
            Ok(())
        }
        Commands::List => run_list(&app, output_mode),
        Commands::Authors { name } => run_authors(&app, &name, output_mode),
        Commands::Config { folder } => {
            if let Some(folder) = folder {
                app.set_paper_dir(&folder).into_diagnostic()?;
            }
            println!("{}", app.paper_dir().into_diagnostic()?);
            Ok(())
        }
        Commands::PurgeCache { doi } => {
            let doi = parse_doi(&doi)?;
            app.purge_cache(&doi).into_diagnostic()?;
            if matches!(output_mode, OutputMode::Interactive) {
                eprintln!("purged cached response for {doi}");
            }
            Ok(())
        }
    }
}

fn parse_doi(raw: &str) -> miette::Result<Doi> {
    raw.parse::<Doi>().into_diagnostic()
}

fn run_add<P: PaperProvider>(app: &App<P>, doi: &str, output_mode: OutputMode) -> miette::Result<()> {
    let doi = parse_doi(doi)?;
    match output_mode {
        OutputMode::Json => {
            let outcome = app.add(&doi, &JsonOutput, &NoProgress).into_diagnostic()?;
            JsonOutput::print(&outcome).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let progress = TermProgress::new();
            let outcome = app
                .add(&doi, &ConsoleOutput, &progress)
                .into_diagnostic()?;
            let verb = if outcome.inserted { "added" } else { "refreshed" };
            println!(
                "{GREEN}{BOLD}{verb}{RESET} \"{}\"\n{CYAN}note:{RESET} {}",
                outcome.title, outcome.note_path
            );
        }
    }
    Ok(())
}

fn run_note<P: PaperProvider>(
    app: &App<P>,
    doi: &str,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let doi = parse_doi(doi)?;
    let path = match output_mode {
        OutputMode::Json => app.generate_note(&doi, &JsonOutput).into_diagnostic()?,
        OutputMode::Interactive => app
            .generate_note(&doi, &ConsoleOutput)
            .into_diagnostic()?,
    };
    println!("{path}");
    Ok(())
}

fn run_sync<P: PaperProvider>(
    app: &App<P>,
    doi: &str,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let doi = parse_doi(doi)?;
    let outcome = app.sync_note(&doi).into_diagnostic()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&outcome).into_diagnostic()?,
        OutputMode::Interactive => {
            for (name, value) in &outcome.tags {
                eprintln!("read metadata {name} = {value}");
            }
            println!("{GREEN}synced{RESET} \"{}\"", outcome.title);
        }
    }
    Ok(())
}

fn run_list<P: PaperProvider>(app: &App<P>, output_mode: OutputMode) -> miette::Result<()> {
    let papers = app.list().into_diagnostic()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_lines(&papers).into_diagnostic()?,
        OutputMode::Interactive => {
            for paper in &papers {
                let conference = paper.conference.as_deref().unwrap_or("-");
                let year = paper
                    .year
                    .map(|year| year.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} | {:<25} | {:>4} | {}",
                    paper.doi, conference, year, paper.title
                );
            }
        }
    }
    Ok(())
}

fn run_authors<P: PaperProvider>(
    app: &App<P>,
    name: &str,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let matches = app.find_author_candidates(name).into_diagnostic()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&matches).into_diagnostic()?,
        OutputMode::Interactive => {
            if matches.is_empty() {
                eprintln!("no catalogued author matches \"{name}\"");
                return Ok(());
            }
            for candidate in &matches {
                println!(
                    "{BOLD}#{}{RESET} {} ({} papers)",
                    candidate.author_id,
                    candidate.name,
                    candidate.papers.len()
                );
                for (title, year) in &candidate.papers {
                    match year {
                        Some(year) => println!("    {year} {title}"),
                        None => println!("    ---- {title}"),
                    }
                }
            }
        }
    }
    Ok(())
}
