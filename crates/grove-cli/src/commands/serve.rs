use grove_core::transport::serve;

use crate::commands::common::AppContext;
use crate::error::CliError;

pub async fn run_serve(ctx: &AppContext) -> Result<(), CliError> {
    ctx.require_sync_enabled()?;
    let service = ctx.sync_service().await?;
    let options = ctx.config.server_options()?;

    println!(
        "Serving {} ({}) on {}://{}",
        ctx.identity.device_name(),
        ctx.identity.device_id(),
        if options.tls { "https" } else { "http" },
        options.bind_addr
    );
    println!("Fingerprint: {}", ctx.identity.fingerprint());
    if !ctx.config.sync.accepting {
        println!("Not accepting sync sessions (status only)");
    }

    serve(service.responder(&ctx.config), options).await?;
    Ok(())
}
