//! Non-destructive removal of vault files.
//!
//! Files are moved under `.trash/`, keeping their relative subpath, and are
//! never deleted. Conflict copies use the same dated names with a counter.

use crate::fs::{FileSystem, Result};
use crate::rules::TRASH_DIR;
use chrono::{Local, NaiveDate};
use tracing::info;

/// Move a file into the sync trash. Returns its new vault-relative path.
///
/// On a name collision the file gets a `-YYYY-MM-DD` suffix before its
/// extension, then a counter if that is taken too.
pub async fn move_to_sync_trash<F: FileSystem + ?Sized>(fs: &F, relative_path: &str) -> Result<String> {
    move_to_sync_trash_on(fs, relative_path, Local::now().date_naive()).await
}

/// [`move_to_sync_trash`] with an explicit date for the collision suffix.
pub async fn move_to_sync_trash_on<F: FileSystem + ?Sized>(
    fs: &F,
    relative_path: &str,
    date: NaiveDate,
) -> Result<String> {
    let relative_path = relative_path.trim_matches('/');
    let target = format!("{}/{}", TRASH_DIR, relative_path);
    let target = free_path(fs, &target, date).await?;

    fs.rename(relative_path, &target).await?;
    info!("Moved {} to {}", relative_path, target);
    Ok(target)
}

/// Sibling path used to keep the local side of a conflict:
/// `notes/plan.md` → `notes/plan.sync-conflict-2024-05-01.md`.
pub fn conflict_copy_path(path: &str, date: NaiveDate) -> String {
    let (stem, ext) = split_extension(path);
    format!("{}.sync-conflict-{}{}", stem, date.format("%Y-%m-%d"), ext)
}

/// [`conflict_copy_path`], or the first of `-2`, `-3`, ... after it that no
/// existing file uses. A second conflict on the same day never overwrites
/// the first copy.
pub async fn free_conflict_copy_path<F: FileSystem + ?Sized>(
    fs: &F,
    path: &str,
    date: NaiveDate,
) -> Result<String> {
    let (stem, ext) = split_extension(path);
    let stem = format!("{}.sync-conflict-{}", stem, date.format("%Y-%m-%d"));
    first_free(fs, &stem, ext).await
}

async fn free_path<F: FileSystem + ?Sized>(fs: &F, wanted: &str, date: NaiveDate) -> Result<String> {
    if !fs.exists(wanted).await? {
        return Ok(wanted.to_string());
    }

    let (stem, ext) = split_extension(wanted);
    let dated = format!("{}-{}", stem, date.format("%Y-%m-%d"));
    first_free(fs, &dated, ext).await
}

/// `stem` + `ext`, then `stem-2` + `ext`, `stem-3` + `ext`, ...
async fn first_free<F: FileSystem + ?Sized>(fs: &F, stem: &str, ext: &str) -> Result<String> {
    let candidate = format!("{}{}", stem, ext);
    if !fs.exists(&candidate).await? {
        return Ok(candidate);
    }

    let mut n = 2;
    loop {
        let candidate = format!("{}-{}{}", stem, n, ext);
        if !fs.exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Split `dir/name.ext` into (`dir/name`, `.ext`). Dotfiles and names
/// without a dot have no extension.
fn split_extension(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(0) | None => (path, ""),
        Some(dot) => path.split_at(name_start + dot),
    }
}
