//! Naming convention for nested isolation boundaries.
//!
//! A boundary `a -> b -> c` lives at `<root>/<seg>/a/<seg>/b/<seg>/c`, one
//! prefix segment per level. Nothing here touches the filesystem.
use std::path::{Path, PathBuf};

use berth_model::ContainerId;

/// Segment placed before every boundary level.
pub const CONTAINER_SEGMENT: &str = "containers";

/// Joins `segment/value` for each level of `lineage`, outermost first.
pub fn nested_path<'a>(root: &Path, segment: &str, lineage: impl IntoIterator<Item = &'a str>) -> PathBuf {
    let mut path = root.to_path_buf();
    for value in lineage {
        path.push(segment);
        path.push(value);
    }
    path
}

/// Directory of `container_id` below `root`.
#[inline]
pub fn container_path(root: &Path, container_id: &ContainerId) -> PathBuf {
    nested_path(root, CONTAINER_SEGMENT, container_id.lineage())
}
