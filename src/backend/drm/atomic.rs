//! One atomic KMS commit worth of property writes.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, error, warn};

use super::device::{
    AtomicFlags, AtomicItem, CommitFences, FenceRequest, FenceSlot, KmsDevice, ObjectType,
};
use super::props::DrmProperty;
use crate::context::HwcContext;
use crate::error::{HwcError, Result};

/// Human-readable names for KMS objects, used in commit dumps.
#[derive(Debug, Default, Clone)]
pub struct ObjectLabels {
    labels: HashMap<u32, (ObjectType, usize)>,
}

impl ObjectLabels {
    pub fn insert(&mut self, object_id: u32, ty: ObjectType, index: usize) {
        self.labels.insert(object_id, (ty, index));
    }

    pub fn label(&self, object_id: u32) -> String {
        match self.labels.get(&object_id) {
            Some((ty, index)) => format!("{ty:?}[{index}]"),
            None => String::from("Object"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedProperty {
    item: AtomicItem,
    name: &'static str,
}

/// Accumulates property writes and issues them as a single atomic commit.
///
/// Blobs queued with [`AtomicReq::add_old_blob`] are destroyed when the request is dropped,
/// after the commit has been resolved one way or the other.
pub struct AtomicReq<'a> {
    device: &'a dyn KmsDevice,
    ctx: &'a HwcContext,
    labels: &'a ObjectLabels,
    props: Vec<QueuedProperty>,
    fences: Vec<FenceRequest>,
    old_blobs: Vec<u32>,
    error: Option<i32>,
}

impl<'a> AtomicReq<'a> {
    pub fn new(device: &'a dyn KmsDevice, ctx: &'a HwcContext, labels: &'a ObjectLabels) -> Self {
        Self {
            device,
            ctx,
            labels,
            props: Vec::new(),
            fences: Vec::new(),
            old_blobs: Vec::new(),
            error: None,
        }
    }

    /// Queues one property write.
    ///
    /// A property the kernel does not expose is an error unless `optional` is set, in which
    /// case the write is silently dropped. Immutable properties are never written.
    pub fn add_property(
        &mut self,
        object_id: u32,
        property: &DrmProperty,
        value: u64,
        optional: bool,
    ) -> Result<()> {
        if !property.is_available() {
            if optional {
                return Ok(());
            }
            error!(
                "object {object_id} has no {} property, cannot set {value}",
                property.name()
            );
            self.set_error(-libc::EINVAL);
            return Err(HwcError::MissingProperty {
                name: property.name().to_owned(),
                object_id,
            });
        }

        if property.is_immutable() {
            return Ok(());
        }

        self.props.push(QueuedProperty {
            item: AtomicItem {
                object_id,
                property_id: property.id(),
                value,
            },
            name: property.name(),
        });
        Ok(())
    }

    /// Queues an out-fence pointer property; the fence comes back from [`AtomicReq::commit`].
    pub fn add_out_fence(
        &mut self,
        object_id: u32,
        property: &DrmProperty,
        slot: FenceSlot,
    ) -> Result<()> {
        if !property.is_available() {
            self.set_error(-libc::EINVAL);
            return Err(HwcError::MissingProperty {
                name: property.name().to_owned(),
                object_id,
            });
        }

        self.fences.push(FenceRequest {
            object_id,
            property_id: property.id(),
            slot,
        });
        Ok(())
    }

    /// Queues a blob to be destroyed once this request is done with.
    pub fn add_old_blob(&mut self, blob_id: u32) {
        if blob_id != 0 {
            self.old_blobs.push(blob_id);
        }
    }

    /// Takes a blob back off the destroy list, e.g. once a commit made it current.
    pub fn forget_old_blob(&mut self, blob_id: u32) {
        self.old_blobs.retain(|&id| id != blob_id);
    }

    pub fn set_error(&mut self, errno: i32) {
        self.error = Some(errno);
    }

    pub fn error(&self) -> Option<i32> {
        self.error
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Value queued for a property, last write wins.
    pub fn queued_value(&self, object_id: u32, property: &DrmProperty) -> Option<u64> {
        self.props
            .iter()
            .rev()
            .find(|p| p.item.object_id == object_id && p.item.property_id == property.id())
            .map(|p| p.item.value)
    }

    pub fn commit(&mut self, flags: AtomicFlags, logging_for_debug: bool) -> Result<CommitFences> {
        let _span = tracy_client::span!("AtomicReq::commit");

        let items: Vec<AtomicItem> = self.props.iter().map(|p| p.item).collect();
        match self.device.atomic_commit(&items, &self.fences, flags) {
            Ok(fences) => {
                if logging_for_debug {
                    debug!("atomic commit {flags:?}\n{}", self.dump());
                }
                self.ctx.record_commit(true);
                if !flags.contains(AtomicFlags::TEST_ONLY) {
                    self.ctx.disable_drm_debug_messages();
                }
                Ok(fences)
            }
            Err(err) => {
                let errno = -err.raw_os_error().unwrap_or(libc::EIO);

                // Commits are expected to be rejected while the trusted UI owns the display.
                if errno == -libc::EPERM && self.ctx.is_tui_active() {
                    debug!("atomic commit rejected during trusted UI session, ignoring");
                    return Ok(CommitFences::default());
                }

                self.set_error(errno);
                self.ctx.record_commit(false);

                if flags.contains(AtomicFlags::TEST_ONLY) {
                    debug!("test-only atomic commit failed: {err}");
                } else {
                    error!("atomic commit {flags:?} failed: {err}\n{}", self.dump());
                    self.ctx.enable_drm_debug_messages(errno);
                }

                Err(HwcError::Commit { errno })
            }
        }
    }

    /// One line per queued property.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, p) in self.props.iter().enumerate() {
            let _ = writeln!(
                out,
                "property[{i}] {} object_id: {}, property_id: {}, name: {}, value: {}",
                self.labels.label(p.item.object_id),
                p.item.object_id,
                p.item.property_id,
                p.name,
                p.item.value,
            );
        }
        for fence in &self.fences {
            let _ = writeln!(
                out,
                "fence {:?} {} object_id: {}, property_id: {}",
                fence.slot,
                self.labels.label(fence.object_id),
                fence.object_id,
                fence.property_id,
            );
        }
        out
    }
}

impl Drop for AtomicReq<'_> {
    fn drop(&mut self) {
        for blob_id in self.old_blobs.drain(..) {
            if let Err(err) = self.device.destroy_blob(blob_id) {
                warn!("error destroying old blob {blob_id}: {err}");
            }
        }
    }
}
