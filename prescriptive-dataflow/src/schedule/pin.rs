//! Strided worker-to-core pinning.

/// Pin the calling worker to a core chosen by `index * stride`, round-robin over the
/// available cores. A zero stride disables pinning; platforms without affinity support
/// are silently left alone.
pub(crate) fn pin_worker(index: usize, stride: usize) {
    if stride == 0 {
        return;
    }
    let Some(cores) = core_affinity::get_core_ids() else {
        return;
    };
    if cores.is_empty() {
        return;
    }
    let core = cores[(index * stride) % cores.len()];
    if !core_affinity::set_for_current(core) {
        log::debug!("failed to pin worker {} to core {:?}", index, core.id);
    }
}
