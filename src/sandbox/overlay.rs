//! Instructor overlays and `.gitcheckout` removal directives.

use std::io;
use std::path::{Component, Path};

use super::{CommandLog, Invocation};
use crate::config::OverlayConfig;
use crate::error::RunnerError;

/// Unpack archives (honoring excludes) or copy single files into
/// `checkoutdir`, then apply any `rm:<path>` lines from `.gitcheckout`.
pub fn apply_overlay(
    cl: &mut CommandLog<'_>,
    checkoutdir: &Path,
    overlays: &[OverlayConfig],
    root: &Path,
) -> Result<(), RunnerError> {
    for overlay in overlays {
        let path = overlay.absolute_path(root);
        let ok = if overlay.is_archive() {
            let mut inv = Invocation::new("tar")
                .arg("-xf")
                .path_arg(&path)
                .current_dir(checkoutdir);
            for exclude in &overlay.exclude {
                inv = inv.arg("--exclude").arg(exclude.as_str());
            }
            cl.run(&inv)? == 0
        } else {
            let target = path.file_name().map(|name| checkoutdir.join(name));
            cl.note(&format!(
                "cp {} {}",
                super::shell_quote(&path.to_string_lossy()),
                super::shell_quote(&checkoutdir.to_string_lossy())
            ))?;
            target.is_some_and(|target| std::fs::copy(&path, target).is_ok())
        };
        if !ok {
            return Err(RunnerError::env("Can't unpack overlay"));
        }
    }

    apply_checkout_instructions(cl, checkoutdir)
}

/// Paths named by `rm:` lines must stay inside the checkout.
pub fn removal_target(checkoutdir: &Path, line: &str) -> Option<std::path::PathBuf> {
    let rel = Path::new(line.strip_prefix("rm:")?.trim());
    if rel.as_os_str().is_empty() {
        return None;
    }
    let inside = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    inside.then(|| checkoutdir.join(rel))
}

/// Whether reaching `target` from `checkoutdir` passes through a symlinked
/// directory. The final component itself may be a symlink; it is removed,
/// not followed.
fn crosses_symlink(checkoutdir: &Path, target: &Path) -> bool {
    let Ok(rel) = target.strip_prefix(checkoutdir) else {
        return true;
    };
    let mut parents: Vec<Component<'_>> = rel.components().collect();
    parents.pop();
    let mut cur = checkoutdir.to_path_buf();
    for component in parents {
        cur.push(component);
        if std::fs::symlink_metadata(&cur).is_ok_and(|m| m.file_type().is_symlink()) {
            return true;
        }
    }
    false
}

fn remove_target(target: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(target)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    }
}

fn apply_checkout_instructions(cl: &mut CommandLog<'_>, checkoutdir: &Path) -> Result<(), RunnerError> {
    let Ok(text) = std::fs::read_to_string(checkoutdir.join(".gitcheckout")) else {
        return Ok(());
    };
    for line in text.lines() {
        let Some(target) = removal_target(checkoutdir, line) else {
            continue;
        };
        if crosses_symlink(checkoutdir, &target) {
            tracing::warn!(target = %target.display(), "refusing removal through a symlink");
            continue;
        }
        cl.note(&format!("rm -rf {}", super::shell_quote(&target.to_string_lossy())))?;
        match remove_target(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(target = %target.display(), error = %e, "can't remove checkout path"),
        }
    }
    Ok(())
}
