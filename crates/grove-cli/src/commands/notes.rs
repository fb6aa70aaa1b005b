use crate::commands::common::{
    format_note_lines, parse_note_id, resolve_note_content, AppContext,
};
use crate::error::CliError;

pub async fn run_note_add(content_parts: &[String], ctx: &AppContext) -> Result<(), CliError> {
    let content = resolve_note_content(content_parts)?;
    let note = ctx.db.create_note(&content).await?;

    println!("{}", note.id);
    Ok(())
}

pub async fn run_note_list(limit: usize, as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let notes = ctx.db.list_notes(limit, 0).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&notes)?);
    } else if notes.is_empty() {
        println!("No notes yet.");
    } else {
        for line in format_note_lines(&notes) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_note_delete(id: &str, ctx: &AppContext) -> Result<(), CliError> {
    let note_id = parse_note_id(id)?;
    let exists = ctx
        .db
        .get_note(&note_id)
        .await?
        .is_some_and(|note| !note.is_deleted());
    if !exists {
        return Err(CliError::NoteNotFound(id.to_string()));
    }

    ctx.db.delete_note(&note_id).await?;
    println!("{note_id}");
    Ok(())
}
