//! Device tree overlay application, following the libfdt algorithm:
//! renumber the overlay phandles above the base ones, patch local and
//! external references, merge every fragment into its target and export
//! the overlay labels.

use log::{debug, warn};

use crate::fdt::{str_value, Fdt, FdtError, FdtResult, Node};

const OVERLAY_NODE: &str = "__overlay__";
const FIXUPS_NODE: &str = "__fixups__";
const LOCAL_FIXUPS_NODE: &str = "__local_fixups__";
const SYMBOLS_NODE: &str = "__symbols__";

fn bad_overlay(msg: impl Into<String>) -> FdtError {
    FdtError::BadOverlay(msg.into())
}

/// Add `delta` to the cell at `offset`, failing when the phandle space
/// runs out
fn add_be32(value: &mut [u8], offset: usize, delta: u32) -> FdtResult<u32> {
    let bytes = value.get_mut(offset..offset + 4).ok_or_else(|| bad_overlay("fixup offset out of range"))?;
    let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        .checked_add(delta)
        .ok_or(FdtError::NoPhandles)?;
    bytes.copy_from_slice(&v.to_be_bytes());
    Ok(v)
}

fn adjust_phandles(overlay: &mut Fdt, delta: u32) -> FdtResult<()> {
    let mut result = Ok(());
    overlay.for_each_node_mut(&mut |node: &mut Node| {
        for name in ["phandle", "linux,phandle"] {
            let Some(prop) = node.property_mut(name) else {
                continue;
            };
            let adjusted = match prop.as_u32() {
                Some(ph) if ph != 0 && ph != u32::MAX => add_be32(&mut prop.value, 0, delta),
                _ => Err(FdtError::BadPhandle),
            };
            match adjusted {
                Ok(u32::MAX) => result = Err(FdtError::NoPhandles),
                Ok(_) => {}
                Err(e) => result = Err(e),
            }
        }
    });
    result
}

/// Walk __local_fixups__ in parallel with the overlay tree
fn adjust_local_refs(node: &mut Node, fixups: &Node, delta: u32) -> FdtResult<()> {
    for fixup in &fixups.properties {
        let prop = node
            .property_mut(&fixup.name)
            .ok_or_else(|| bad_overlay(format!("local fixup for missing property {}", fixup.name)))?;
        if fixup.value.len() % 4 != 0 {
            return Err(bad_overlay("malformed local fixup"));
        }
        for offset in fixup.as_u32_list() {
            add_be32(&mut prop.value, offset as usize, delta)?;
        }
    }
    for fixup_child in &fixups.children {
        let child = node
            .child_mut(&fixup_child.name)
            .ok_or_else(|| bad_overlay(format!("local fixup for missing node {}", fixup_child.name)))?;
        adjust_local_refs(child, fixup_child, delta)?;
    }
    Ok(())
}

/// "path:property:offset"
fn parse_fixup(entry: &str) -> FdtResult<(&str, &str, usize)> {
    let mut parts = entry.rsplitn(3, ':');
    let offset = parts.next().ok_or_else(|| bad_overlay(entry.to_string()))?;
    let prop = parts.next().ok_or_else(|| bad_overlay(entry.to_string()))?;
    let path = parts.next().ok_or_else(|| bad_overlay(entry.to_string()))?;
    let offset = offset.parse::<usize>().map_err(|_| bad_overlay(entry.to_string()))?;
    if path.is_empty() || prop.is_empty() {
        return Err(bad_overlay(entry.to_string()));
    }
    Ok((path, prop, offset))
}

/// Resolve references to base labels through the base __symbols__
fn fixup_phandles(base: &Fdt, overlay: &mut Fdt) -> FdtResult<()> {
    let Some(fixups) = overlay.root.child(FIXUPS_NODE).cloned() else {
        return Ok(());
    };
    for label in &fixups.properties {
        let symbol_path = base
            .getprop(&format!("/{}", SYMBOLS_NODE), &label.name)
            .and_then(|p| p.as_str())
            .ok_or_else(|| FdtError::NotFound(format!("symbol {}", label.name)))?;
        let phandle = base
            .node(symbol_path)
            .and_then(|n| n.phandle())
            .ok_or(FdtError::BadPhandle)?;
        for entry in label.as_str_list() {
            let (path, prop, offset) = parse_fixup(entry)?;
            let node = overlay.node_mut(path).ok_or_else(|| bad_overlay(format!("fixup node {}", path)))?;
            let value = &mut node
                .property_mut(prop)
                .ok_or_else(|| bad_overlay(format!("fixup property {}", prop)))?
                .value;
            let slot = value.get_mut(offset..offset + 4).ok_or_else(|| bad_overlay("fixup offset out of range"))?;
            slot.copy_from_slice(&phandle.to_be_bytes());
        }
    }
    Ok(())
}

fn fragment_target(base: &Fdt, fragment: &Node) -> FdtResult<String> {
    if let Some(target) = fragment.property("target") {
        let phandle = target.as_u32().ok_or(FdtError::BadPhandle)?;
        if phandle == 0 || phandle == u32::MAX {
            return Err(FdtError::BadPhandle);
        }
        return base.path_of_phandle(phandle).ok_or_else(|| FdtError::NotFound(format!("phandle {:#x}", phandle)));
    }
    if let Some(path) = fragment.property("target-path").and_then(|p| p.as_str()) {
        let path = base.resolve_path(path)?;
        if base.node(&path).is_none() {
            return Err(FdtError::NotFound(path));
        }
        return Ok(path);
    }
    Err(bad_overlay(format!("fragment {} has no target", fragment.name)))
}

fn merge_node(target: &mut Node, overlay: &Node) {
    for prop in &overlay.properties {
        target.set_property(&prop.name, prop.value.clone());
    }
    for child in &overlay.children {
        let existing = target.children.iter_mut().find(|c| c.name == child.name);
        match existing {
            Some(t) => merge_node(t, child),
            None => {
                let mut fresh = Node::new(&child.name);
                merge_node(&mut fresh, child);
                target.children.push(fresh);
            }
        }
    }
}

fn update_symbols(base: &mut Fdt, overlay: &Fdt, targets: &[(String, String)]) -> FdtResult<()> {
    let Some(symbols) = overlay.root.child(SYMBOLS_NODE) else {
        return Ok(());
    };
    for symbol in &symbols.properties {
        let Some(path) = symbol.as_str() else {
            return Err(bad_overlay(format!("symbol {} is not a string", symbol.name)));
        };
        // only labels inside fragments are exported: /<fragment>/__overlay__[/rest]
        let mut comps = path.trim_start_matches('/').splitn(3, '/');
        let (Some(frag), Some(OVERLAY_NODE)) = (comps.next(), comps.next()) else {
            continue;
        };
        let rest = comps.next().unwrap_or("");
        let Some((_, target_path)) = targets.iter().find(|(f, _)| f == frag) else {
            continue;
        };
        let new_path = match (target_path.as_str(), rest.is_empty()) {
            (t, true) => t.to_string(),
            ("/", false) => format!("/{}", rest),
            (t, false) => format!("{}/{}", t, rest),
        };
        debug!("overlay symbol {} -> {}", symbol.name, new_path);
        base.find_or_add_node(&format!("/{}", SYMBOLS_NODE))
            .set_property(&symbol.name, str_value(&new_path));
    }
    Ok(())
}

/// Apply `overlay` on top of `base`. On error `base` may be partially
/// modified; callers keep their own copy of the last good tree.
pub fn overlay_apply(base: &mut Fdt, mut overlay: Fdt) -> FdtResult<()> {
    let delta = base.max_phandle();
    adjust_phandles(&mut overlay, delta)?;
    if let Some(local) = overlay.root.child(LOCAL_FIXUPS_NODE).cloned() {
        adjust_local_refs(&mut overlay.root, &local, delta)?;
    }
    fixup_phandles(base, &mut overlay)?;

    let mut targets = Vec::new();
    for fragment in &overlay.root.children {
        let Some(content) = fragment.child(OVERLAY_NODE).filter(|c| c.name == OVERLAY_NODE) else {
            continue;
        };
        let target_path = fragment_target(base, fragment).map_err(|e| {
            warn!("failed to resolve target of {}: {}", fragment.name, e);
            e
        })?;
        let target = base.node_mut(&target_path).ok_or_else(|| FdtError::NotFound(target_path.clone()))?;
        merge_node(target, content);
        targets.push((fragment.name.clone(), target_path));
    }
    update_symbols(base, &overlay, &targets)
}
