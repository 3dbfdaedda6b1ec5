use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{Level, event, info_span};

use super::RuntimeInner;
use crate::core::{Result, SlotType, parse_vat_slot};

/// What one collection pass reported to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub dropped_imports: Vec<String>,
    pub retired_imports: Vec<String>,
    pub retired_exports: Vec<String>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.dropped_imports.is_empty()
            && self.retired_imports.is_empty()
            && self.retired_exports.is_empty()
    }
}

impl RuntimeInner {
    /// Reclaim everything that has become unreachable and tell the kernel
    /// about imports and exports this process no longer needs.
    pub(crate) fn bring_out_your_dead(self: &Rc<Self>) -> Result<GcReport> {
        let span = info_span!("bring_out_your_dead");
        let _enter = span.enter();

        // cached contexts pin representatives, so release them first
        self.flush_caches()?;

        let mut imports_to_drop = BTreeSet::new();
        let mut imports_to_retire = BTreeSet::new();
        let mut exports_to_retire = BTreeSet::new();

        loop {
            let mut do_more = false;
            self.process_finalizers();

            for base_ref in self.vrm.take_possibly_dead() {
                if self.get_val_for_slot(&base_ref).is_some() {
                    continue;
                }
                let parsed = parse_vat_slot(&base_ref)?;
                if parsed.slot_type != SlotType::Object {
                    continue;
                }
                if parsed.allocated_by_vat && parsed.is_stored() {
                    if !self.vrm.is_virtual_object_reachable(&base_ref)? {
                        let (more, retirees) = self.vrm.delete_virtual_object(self, &base_ref)?;
                        exports_to_retire.extend(retirees);
                        do_more = do_more || more;
                    }
                } else if parsed.allocated_by_vat {
                    // a dead remotable can never be named again
                    do_more = self.vrm.cease_recognition(self, &base_ref)? || do_more;
                    if self.registry.forget_kernel_recognizable(&base_ref) {
                        exports_to_retire.insert(base_ref);
                    }
                } else if !self.vrm.is_presence_reachable(&base_ref)? {
                    imports_to_drop.insert(base_ref.clone());
                    if !self.vrm.is_vref_recognizable(&base_ref)? {
                        imports_to_retire.insert(base_ref);
                    }
                }
            }

            for vref in self.vrm.take_possibly_retired() {
                if self.get_val_for_slot(&vref).is_none()
                    && !self.vrm.is_presence_reachable(&vref)?
                    && !self.vrm.is_vref_recognizable(&vref)?
                {
                    imports_to_retire.insert(vref);
                }
            }

            // deletions above may have released handles or zeroed refcounts
            self.flush_caches()?;
            self.process_finalizers();
            if !do_more && !self.vrm.has_possibly_dead() {
                break;
            }
        }

        let report = GcReport {
            dropped_imports: imports_to_drop.into_iter().collect(),
            retired_imports: imports_to_retire.into_iter().collect(),
            retired_exports: exports_to_retire.into_iter().collect(),
        };
        if !report.dropped_imports.is_empty() {
            self.store.drop_imports(&report.dropped_imports)?;
        }
        if !report.retired_imports.is_empty() {
            self.store.retire_imports(&report.retired_imports)?;
        }
        if !report.retired_exports.is_empty() {
            self.store.retire_exports(&report.retired_exports)?;
        }
        event!(
            Level::DEBUG,
            dropped = report.dropped_imports.len(),
            retired_imports = report.retired_imports.len(),
            retired_exports = report.retired_exports.len(),
            "collection pass finished"
        );

        self.flush_caches()?;
        Ok(report)
    }
}
