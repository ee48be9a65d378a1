use anyhow::Result;
use switchyard::utils::safe_truncate;
use switchyard::Gateway;

const DESCRIPTION_WIDTH: usize = 72;

pub async fn handle_list(gateway: &Gateway) -> Result<()> {
    let catalog = gateway.list_tools().await;
    if catalog.is_empty() {
        println!("no tools available");
    }
    for definition in catalog.definitions() {
        let server = catalog
            .resolve(&definition.name)
            .map(|mapping| mapping.server.name.as_str())
            .unwrap_or("?");
        println!(
            "{:<32} {:<16} {}",
            definition.name,
            server,
            safe_truncate(&definition.description, DESCRIPTION_WIDTH)
        );
    }
    gateway.pool().drain().await;
    Ok(())
}
