use std::rc::Rc;

use tracing::{Level, event, info_span};

use super::RuntimeInner;
use crate::core::{Result, make_facet_ref, parse_vat_slot};
use crate::storage::enumerate_keys_with_prefix;
use crate::vrm::ExportStatus;

impl RuntimeInner {
    /// Release everything that cannot outlive this incarnation: exported
    /// in-memory objects, kernel-reachable virtual objects and virtual
    /// collections. Ends with a full collection pass.
    pub(crate) fn release_old_state(self: &Rc<Self>) -> Result<()> {
        let span = info_span!("release_old_state");
        let _enter = span.enter();

        // only what the kernel still holds as reachable is abandoned
        let abandoned: Vec<String> = self.registry.take_exported();
        self.registry.clear_kernel_recognizable();
        if !abandoned.is_empty() {
            self.store.abandon_exports(&abandoned)?;
        }
        event!(Level::DEBUG, count = abandoned.len(), "abandoned in-memory exports");

        let mut abandoned_virtual = Vec::new();
        for key in enumerate_keys_with_prefix(&self.store, "vom.es.")? {
            let base_ref = &key["vom.es.".len()..];
            let parsed = parse_vat_slot(base_ref)?;
            if !parsed.is_virtual {
                continue;
            }
            let status = self.store.get(&key)?.unwrap_or_default();
            let faceted = self.vrm.facet_names(parsed.id).is_some();
            for (i, code) in status.chars().enumerate() {
                if code != 'r' {
                    continue;
                }
                let vref = if faceted {
                    make_facet_ref(base_ref, i)
                } else {
                    base_ref.to_string()
                };
                self.vrm.set_export_status(&vref, ExportStatus::None)?;
                abandoned_virtual.push(vref);
            }
            self.vrm.add_to_possibly_dead(base_ref);
        }
        if !abandoned_virtual.is_empty() {
            self.store.abandon_exports(&abandoned_virtual)?;
        }

        self.collections.delete_all_virtual_collections()?;
        self.bring_out_your_dead()?;
        Ok(())
    }
}
