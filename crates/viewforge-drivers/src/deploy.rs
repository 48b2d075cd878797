//! Library staging: download and, optionally, unpack each configured URI.

use std::path::Path;

use flate2::read::GzDecoder;
use viewforge_core::DeploySettings;

/// Download and (optionally) unpack every library in `settings.libs` into
/// `settings.location`. Returns whether every step succeeded; a single
/// failure does not abort the remaining libraries.
pub async fn deploy_all(settings: &DeploySettings) -> bool {
    if settings.libs.is_empty() {
        return true;
    }

    let location = settings.location.clone();
    if let Err(err) = tokio::fs::create_dir_all(&location).await {
        tracing::error!(location, error = %err, "failed to create deploy location");
        return false;
    }

    let mut all_ok = true;
    for uri in &settings.libs {
        if let Err(err) = stage_one(uri, &location, settings.unpack).await {
            tracing::error!(uri, error = %err, "failed to stage library");
            all_ok = false;
        }
    }
    all_ok
}

async fn stage_one(uri: &str, location: &str, unpack: bool) -> anyhow::Result<()> {
    let bytes = reqwest::get(uri)
        .await
        .map_err(|err| anyhow::anyhow!("fetching {uri}: {err}"))?
        .bytes()
        .await
        .map_err(|err| anyhow::anyhow!("reading body of {uri}: {err}"))?;

    if unpack && (uri.ends_with(".tar.gz") || uri.ends_with(".tgz")) {
        let location = location.to_string();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || unpack_tar_gz(&bytes, Path::new(&location)))
            .await
            .map_err(|err| anyhow::anyhow!("unpack join error: {err}"))??;
        return Ok(());
    }

    let file_name = uri.rsplit('/').next().unwrap_or("lib.bin");
    let dest = Path::new(location).join(file_name);
    tokio::fs::write(&dest, &bytes).await?;
    Ok(())
}

fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}
