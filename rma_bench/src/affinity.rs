/// Pin the calling thread to `core`, or to the last online core when `core`
/// is `None`. Failure is logged and the run continues unpinned.
pub fn pin_current_thread(core: Option<usize>) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        tracing::warn!("could not enumerate cores, running unpinned");
        return;
    };
    let core_id = match core {
        Some(id) => id,
        None => match core_ids.iter().map(|c| c.id).max() {
            Some(id) => id,
            None => {
                tracing::warn!("no online cores reported, running unpinned");
                return;
            }
        },
    };

    if core_affinity::set_for_current(core_affinity::CoreId { id: core_id }) {
        tracing::info!("pinned to core {}", core_id);
    } else {
        tracing::warn!("failed to pin to core {}", core_id);
    }
}
