use crate::commands::common::{find_tag, parse_note_id, AppContext};
use crate::error::CliError;

pub async fn run_tag_add(name: &str, parent: Option<&str>, ctx: &AppContext) -> Result<(), CliError> {
    let parent_id = match parent {
        Some(query) => {
            let tags = ctx.db.list_tags().await?;
            let tag = find_tag(&tags, query).ok_or_else(|| CliError::TagNotFound(query.to_string()))?;
            Some(tag.id)
        }
        None => None,
    };

    let tag = ctx.db.create_tag(name, parent_id).await?;
    println!("{}", tag.id);
    Ok(())
}

pub async fn run_tag_assign(note_id: &str, tag: &str, ctx: &AppContext) -> Result<(), CliError> {
    let note_id = parse_note_id(note_id)?;
    let tags = ctx.db.list_tags().await?;
    let tag = find_tag(&tags, tag).ok_or_else(|| CliError::TagNotFound(tag.to_string()))?;

    ctx.db.tag_note(&note_id, &tag.id).await?;
    println!("Tagged {note_id} with {}", tag.name);
    Ok(())
}

pub async fn run_tag_list(ctx: &AppContext) -> Result<(), CliError> {
    let tags = ctx.db.list_tags().await?;
    if tags.is_empty() {
        println!("No tags yet.");
        return Ok(());
    }
    for tag in &tags {
        let parent = tag
            .parent_id
            .and_then(|parent| tags.iter().find(|candidate| candidate.id == parent))
            .map(|parent| format!("  (under {})", parent.name))
            .unwrap_or_default();
        println!("{}  {}{parent}", tag.id, tag.name);
    }
    Ok(())
}
