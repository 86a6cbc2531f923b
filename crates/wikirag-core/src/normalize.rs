//! Transport-safe identifiers for local document names.
//!
//! The hosted store rejects or mangles filenames that are not plain ASCII,
//! so every local document is uploaded under a *safe id* derived from its
//! name by [`normalize`].
//!
//! # Scheme
//!
//! - **Passthrough.** A name made only of `[A-Za-z0-9._-]`, starting with an
//!   ASCII alphanumeric and at most [`MAX_SAFE_ID_LEN`] bytes long, is its own
//!   safe id (`osaka.md` → `osaka.md`).
//! - **Hashed.** Anything else becomes `{slug}~{hash}{.ext}`: the stem is
//!   slugged (ASCII alphanumerics lowercased, every other run collapsed to
//!   `-`, empty slug → `doc`), `hash` is the first 16 hex characters of the
//!   SHA-256 of the *full* original name, and a short alphanumeric extension
//!   is kept (`東京.md` → `doc~3f1c…e2.md`).
//!
//! `~` never survives passthrough, so the two families cannot overlap, and
//! distinct names only collide on a 64-bit hash collision. Such a collision is
//! never ignored: [`assign_safe_ids`] reports it as
//! [`SyncError::NormalizationCollision`].
//!
//! ```rust
//! use wikirag_core::normalize::normalize;
//!
//! assert_eq!(normalize("osaka.md"), "osaka.md");
//! let tokyo = normalize("東京.md");
//! assert!(tokyo.is_ascii());
//! assert!(tokyo.starts_with("doc~") && tokyo.ends_with(".md"));
//! assert_eq!(tokyo, normalize("東京.md"));
//! ```

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Upper bound on the length of any safe id, in bytes.
pub const MAX_SAFE_ID_LEN: usize = 96;

const MAX_SLUG_LEN: usize = 64;
const MAX_EXT_LEN: usize = 10;
const HASH_HEX_LEN: usize = 16;
const HASH_SEPARATOR: char = '~';

/// Derive the safe id for `local_name`. Pure and deterministic.
pub fn normalize(local_name: &str) -> String {
    if is_passthrough(local_name) {
        return local_name.to_string();
    }

    let (stem, ext) = split_extension(local_name);
    let slug = slugify(stem);
    let hash = name_hash(local_name);

    match ext {
        Some(ext) => format!(
            "{}{}{}.{}",
            slug,
            HASH_SEPARATOR,
            hash,
            ext.to_ascii_lowercase()
        ),
        None => format!("{}{}{}", slug, HASH_SEPARATOR, hash),
    }
}

/// Returns `true` if `name` is already transport-safe and is used verbatim.
pub fn is_passthrough(name: &str) -> bool {
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    first_ok
        && name.len() <= MAX_SAFE_ID_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Normalize every name and fail on the first collision.
///
/// Returns `local_name → safe_id`. Duplicate input names are ignored.
pub fn assign_safe_ids<'a, I>(names: I) -> Result<BTreeMap<String, String>, SyncError>
where
    I: IntoIterator<Item = &'a str>,
{
    assign_safe_ids_with(names, normalize)
}

/// [`assign_safe_ids`] with a caller-supplied normalizer.
pub fn assign_safe_ids_with<'a, I, F>(
    names: I,
    normalize: F,
) -> Result<BTreeMap<String, String>, SyncError>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> String,
{
    let mut owners: HashMap<String, &'a str> = HashMap::new();
    let mut assigned = BTreeMap::new();

    for name in names {
        if assigned.contains_key(name) {
            continue;
        }
        let safe_id = normalize(name);
        if let Some(first) = owners.get(&safe_id) {
            return Err(SyncError::NormalizationCollision {
                safe_id,
                first: first.to_string(),
                second: name.to_string(),
            });
        }
        owners.insert(safe_id.clone(), name);
        assigned.insert(name.to_string(), safe_id);
    }

    Ok(assigned)
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let ext = &name[idx + 1..];
            let ext_ok = !ext.is_empty()
                && ext.len() <= MAX_EXT_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric());
            if ext_ok {
                (&name[..idx], Some(ext))
            } else {
                (name, None)
            }
        }
        _ => (name, None),
    }
}

fn slugify(stem: &str) -> String {
    let mut slug = String::with_capacity(stem.len().min(MAX_SLUG_LEN));
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "doc".to_string()
    } else {
        slug.to_string()
    }
}

fn name_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..HASH_HEX_LEN].to_string()
}
