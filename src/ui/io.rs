use crate::app::{CollectionService, SyncService};
use crate::notes::{NewNote, NoteUpdate};
use crate::schema::NoteTypeDefinition;
use crate::setup::arguments::{self, Command, ServerArgs, read_json_arg};
use crate::setup::logging;
use crate::sync::HttpTransport;
use crate::ui::cli;
use crate::CollectionError;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use tabled::Tabled;

/// Abstraction for output
pub trait Output {
    /// Display a bolded title
    fn show_title(&self, title: &str);
    /// Render a list of rows
    fn show_table<T: Tabled + Serialize>(&self, rows: &[T]) -> Result<()>;
    /// Render a single record
    fn show_record<T: Serialize>(&self, record: &T) -> Result<()>;
}

// Search results as a one-column table, or a bare JSON array of ids
#[derive(Tabled, Serialize)]
#[serde(transparent)]
struct NoteId {
    id: i64,
}

/// Initialize logging, parse args, and run the requested command
///
/// # Errors
///
/// Any error from the collection or sync layer, or from reading an argument file
pub fn run() -> Result<()> {
    logging::setup_log();
    let args = arguments::handle_args();
    debug!("Using collection {}", args.collection.display());

    let io = cli::Cli { json: args.json };
    let service = CollectionService::new(&args.collection);
    handle_command(&io, &service, args.command)
}

/// Dispatch a parsed command to its handler
///
/// # Errors
///
/// Forwards the handler's error
pub fn handle_command(io: &impl Output, service: &CollectionService, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            service.init()?;
            info!("Created collection at {}", service.path().display());
            Ok(())
        }
        Command::EnsureModel { definition } => {
            let definition = NoteTypeDefinition::from_json(&read_json_arg(&definition)?)?;
            let id = service.ensure_model(&definition)?;
            io.show_record(&json!({ "id": id, "name": definition.name }))
        }
        Command::ListModels => {
            io.show_title("Note types");
            io.show_table(&service.list_models()?)
        }
        Command::EnsureDeck { name } => {
            let id = service.ensure_deck(&name)?;
            io.show_record(&json!({ "id": id, "name": name }))
        }
        Command::ListDecks => {
            io.show_title("Decks");
            io.show_table(&service.list_decks()?)
        }
        Command::AddNote { note } => {
            let note: NewNote = parse_record(&note)?;
            let id = service.add_note(&note)?;
            io.show_record(&json!({ "id": id }))
        }
        Command::UpdateNote { note } => {
            let update: NoteUpdate = parse_record(&note)?;
            service.update_note(&update)?;
            info!("Updated note {}", update.id);
            Ok(())
        }
        Command::DeleteNote { id } => {
            service.delete_note(id)?;
            Ok(())
        }
        Command::GetNote { id } => {
            io.show_title(&format!("Note {id}"));
            io.show_record(&service.get_note(id)?)
        }
        Command::FindNotes { query } => {
            let ids: Vec<NoteId> = service
                .find_notes(&query)?
                .into_iter()
                .map(|id| NoteId { id })
                .collect();
            io.show_table(&ids)
        }
        Command::Login(server) => {
            let sync = sync_service(service, &server)?;
            io.show_record(&sync.login(&server.credentials())?)
        }
        Command::Sync(server) => {
            let sync = sync_service(service, &server)?;
            io.show_record(&sync.sync(&server.credentials())?)
        }
        Command::FullUpload(server) => {
            let sync = sync_service(service, &server)?;
            io.show_record(&sync.full_upload(&server.credentials())?)
        }
        Command::FullDownload(server) => {
            let sync = sync_service(service, &server)?;
            io.show_record(&sync.full_download(&server.credentials())?)
        }
    }
}

fn sync_service(
    service: &CollectionService,
    server: &ServerArgs,
) -> Result<SyncService<HttpTransport>> {
    Ok(SyncService::new(service.path(), server.transport()?))
}

fn parse_record<T: serde::de::DeserializeOwned>(arg: &str) -> Result<T> {
    let json = read_json_arg(arg)?;
    serde_json::from_str(&json)
        .map_err(|e| CollectionError::InvalidDefinition(e.to_string()))
        .context("Malformed note record")
}
