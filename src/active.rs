//! Bootstrap from active and descriptions files.
//!
//! The active file carries one group per line, `<name> <high> <low>
//! <status>`. Groups missing from the registry are created with defaults;
//! existing groups are never overwritten. The descriptions file carries
//! `<name>\t<description>` lines and only updates descriptions.

use std::path::Path;

use crate::error::Result;
use crate::store::MainDb;

/// Read an active file and register any missing groups. Returns the number
/// of groups created.
pub async fn load_active_file(main: &MainDb, path: &Path) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut created = 0;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let _high = parts.next();
        let _low = parts.next();
        let status = parts.next().unwrap_or("y");

        let existed = main.get_group(name).await?.is_some();
        main.create_group_if_missing(name, status).await?;
        if !existed {
            created += 1;
        }
    }
    tracing::info!(path = %path.display(), created, "active file loaded");
    Ok(created)
}

/// Read a descriptions file and update group descriptions. Unknown groups
/// are skipped.
pub async fn load_descriptions_file(main: &MainDb, path: &Path) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut updated = 0;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, description)) = line.split_once('\t') else {
            continue;
        };
        if main.get_group(name).await?.is_none() {
            continue;
        }
        main.set_group_description(name, description.trim()).await?;
        updated += 1;
    }
    tracing::info!(path = %path.display(), updated, "descriptions file loaded");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_active_file_creates_missing_groups_only() {
        let dir = TempDir::new().unwrap();
        let main = MainDb::open(&dir.path().join("main.db")).await.unwrap();

        // Pre-existing group with counters that must survive.
        main.create_group_if_missing("misc.test", "y").await.unwrap();
        main.update_group_counters("misc.test", 1, 10, 10, None)
            .await
            .unwrap();

        let active = dir.path().join("active");
        tokio::fs::write(
            &active,
            "# comment\nmisc.test 500 1 y\ncomp.lang.rust 0 1 y\nalt.moderated 3 1 m\n",
        )
        .await
        .unwrap();

        let created = load_active_file(&main, &active).await.unwrap();
        assert_eq!(created, 2);

        // Existing group untouched by the file's counters.
        let existing = main.get_group("misc.test").await.unwrap().unwrap();
        assert_eq!(existing.high_water, 10);

        let moderated = main.get_group("alt.moderated").await.unwrap().unwrap();
        assert_eq!(moderated.status, "m");
        main.close().await;
    }

    #[tokio::test]
    async fn test_descriptions_update_only_known_groups() {
        let dir = TempDir::new().unwrap();
        let main = MainDb::open(&dir.path().join("main.db")).await.unwrap();
        main.create_group_if_missing("misc.test", "y").await.unwrap();

        let descriptions = dir.path().join("newsgroups");
        tokio::fs::write(
            &descriptions,
            "# comment\nmisc.test\tGeneral discussion\nno.such.group\tIgnored\n",
        )
        .await
        .unwrap();

        let updated = load_descriptions_file(&main, &descriptions).await.unwrap();
        assert_eq!(updated, 1);
        assert_eq!(
            main.get_group("misc.test").await.unwrap().unwrap().description,
            "General discussion"
        );
        main.close().await;
    }
}
