//! Render passes built from attachments and subpasses.
//!
//! A [`RenderPass`] is assembled incrementally: attachments are declared with
//! [`RenderPass::add_attachment`], referenced from [`SubPass`]es, the subpasses
//! are added in order, and [`RenderPass::finalize`] creates the native object.
//! Nothing can be added after finalization.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, warn};

/// Role of an attachment within a subpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentType {
    Input,
    Color,
    Depth,
    Resolve,
    Preserve,
}

impl AttachmentType {
    /// Layout used by a subpass reference when the caller does not pick one.
    pub fn default_layout(self) -> vk::ImageLayout {
        match self {
            Self::Input => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::Color | Self::Resolve => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::Depth => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::Preserve => vk::ImageLayout::UNDEFINED,
        }
    }

    /// Sample count of an attachment of this type in a pass using `pass_samples`.
    ///
    /// Color and depth attachments are multisampled with the pass; input,
    /// resolve and preserve attachments are always single-sampled.
    pub fn sample_count(self, pass_samples: vk::SampleCountFlags) -> vk::SampleCountFlags {
        match self {
            Self::Color | Self::Depth => pass_samples,
            Self::Input | Self::Resolve | Self::Preserve => vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Handle to an attachment declared on a render pass.
#[derive(Debug, PartialEq, Eq)]
pub struct RenderAttachment {
    kind: AttachmentType,
    index: u32,
    format: vk::Format,
}

impl RenderAttachment {
    pub fn kind(&self) -> AttachmentType {
        self.kind
    }

    /// Position in the render pass's attachment list.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

/// The attachments one subpass reads and writes.
#[derive(Debug, Default)]
pub struct SubPass {
    inputs: Vec<vk::AttachmentReference>,
    colors: Vec<vk::AttachmentReference>,
    resolves: Vec<vk::AttachmentReference>,
    depth: Option<vk::AttachmentReference>,
    preserves: Vec<u32>,
    finalized: bool,
}

impl SubPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference an attachment, using the type's default layout when `layout` is `None`.
    ///
    /// Does nothing once the subpass has been added to a render pass.
    pub fn add_attachment(
        &mut self,
        attachment: &RenderAttachment,
        layout: Option<vk::ImageLayout>,
    ) -> &mut Self {
        if self.finalized {
            warn!(
                "Subpass already added to a render pass; ignoring attachment {}",
                attachment.index
            );
            return self;
        }

        let reference = vk::AttachmentReference {
            attachment: attachment.index,
            layout: layout.unwrap_or_else(|| attachment.kind.default_layout()),
        };
        match attachment.kind {
            AttachmentType::Input => self.inputs.push(reference),
            AttachmentType::Color => self.colors.push(reference),
            AttachmentType::Resolve => self.resolves.push(reference),
            AttachmentType::Preserve => self.preserves.push(attachment.index),
            AttachmentType::Depth => {
                if let Some(previous) = self.depth.replace(reference) {
                    warn!(
                        "Subpass depth attachment {} replaced by {}",
                        previous.attachment, attachment.index
                    );
                }
            }
        }
        self
    }

    /// Whether the subpass has been added to a render pass.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn color_count(&self) -> usize {
        self.colors.len()
    }

    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }
}

/// Owned copy of a subpass, kept until the native pass is created.
#[derive(Debug, Clone)]
struct SubpassData {
    flags: vk::SubpassDescriptionFlags,
    bind_point: vk::PipelineBindPoint,
    inputs: Vec<vk::AttachmentReference>,
    colors: Vec<vk::AttachmentReference>,
    resolves: Vec<vk::AttachmentReference>,
    depth: Option<vk::AttachmentReference>,
    preserves: Vec<u32>,
}

impl SubpassData {
    fn description(&self) -> vk::SubpassDescription<'_> {
        let mut description = vk::SubpassDescription::default()
            .flags(self.flags)
            .pipeline_bind_point(self.bind_point)
            .input_attachments(&self.inputs)
            .color_attachments(&self.colors)
            .preserve_attachments(&self.preserves);
        if !self.resolves.is_empty() {
            description = description.resolve_attachments(&self.resolves);
        }
        if let Some(depth) = self.depth.as_ref() {
            description = description.depth_stencil_attachment(depth);
        }
        description
    }
}

/// Attachment, subpass and dependency lists of a render pass.
#[derive(Debug, Clone)]
struct PassLayout {
    samples: vk::SampleCountFlags,
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<SubpassData>,
    dependencies: Vec<vk::SubpassDependency>,
    has_depth_stencil: bool,
    sealed: bool,
}

impl PassLayout {
    fn new(samples: vk::SampleCountFlags) -> Self {
        Self {
            samples,
            attachments: Vec::new(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            has_depth_stencil: false,
            sealed: false,
        }
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.sealed {
            return Err(GpuError::InvalidState(format!(
                "cannot add {what} to a finalized render pass"
            )));
        }
        Ok(())
    }

    fn add_attachment(
        &mut self,
        kind: AttachmentType,
        format: vk::Format,
        layouts: (vk::ImageLayout, vk::ImageLayout),
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
    ) -> Result<RenderAttachment> {
        self.ensure_open("attachments")?;
        let description = vk::AttachmentDescription::default()
            .format(format)
            .samples(kind.sample_count(self.samples))
            .load_op(load_op)
            .store_op(store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(layouts.0)
            .final_layout(layouts.1);

        let index = self.attachments.len() as u32;
        self.attachments.push(description);
        Ok(RenderAttachment {
            kind,
            index,
            format,
        })
    }

    fn add_subpass(
        &mut self,
        subpass: &mut SubPass,
        flags: vk::SubpassDescriptionFlags,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<u32> {
        self.ensure_open("subpasses")?;
        if subpass.finalized {
            return Err(GpuError::InvalidState(
                "subpass was already added to a render pass".to_string(),
            ));
        }
        if !subpass.resolves.is_empty() && subpass.resolves.len() != subpass.colors.len() {
            return Err(GpuError::InvalidConfig(format!(
                "subpass has {} resolve attachments for {} color attachments",
                subpass.resolves.len(),
                subpass.colors.len()
            )));
        }
        let count = self.attachments.len() as u32;
        let out_of_range = subpass
            .inputs
            .iter()
            .chain(&subpass.colors)
            .chain(&subpass.resolves)
            .chain(&subpass.depth)
            .map(|r| r.attachment)
            .chain(subpass.preserves.iter().copied())
            .find(|&index| index >= count);
        if let Some(index) = out_of_range {
            return Err(GpuError::InvalidConfig(format!(
                "subpass references attachment {index} but the pass has {count}"
            )));
        }

        if subpass.depth.is_some() {
            self.has_depth_stencil = true;
        }
        self.subpasses.push(SubpassData {
            flags,
            bind_point,
            inputs: subpass.inputs.clone(),
            colors: subpass.colors.clone(),
            resolves: subpass.resolves.clone(),
            depth: subpass.depth,
            preserves: subpass.preserves.clone(),
        });
        subpass.finalized = true;
        Ok(self.subpasses.len() as u32 - 1)
    }

    fn add_dependency(&mut self, dependency: vk::SubpassDependency) -> Result<()> {
        self.ensure_open("dependencies")?;
        let count = self.subpasses.len() as u32;
        for subpass in [dependency.src_subpass, dependency.dst_subpass] {
            if subpass != vk::SUBPASS_EXTERNAL && subpass >= count {
                return Err(GpuError::InvalidConfig(format!(
                    "dependency references subpass {subpass} but the pass has {count}"
                )));
            }
        }
        self.dependencies.push(dependency);
        Ok(())
    }
}

/// A native render pass plus the description it was built from.
pub struct RenderPass {
    device: Arc<Device>,
    handle: vk::RenderPass,
    layout: PassLayout,
}

impl RenderPass {
    /// Start a render pass whose color and depth attachments use `samples`.
    pub fn new(device: &Arc<Device>, samples: vk::SampleCountFlags) -> Self {
        Self {
            device: Arc::clone(device),
            handle: vk::RenderPass::null(),
            layout: PassLayout::new(samples),
        }
    }

    /// Declare an attachment.
    pub fn add_attachment(
        &mut self,
        kind: AttachmentType,
        format: vk::Format,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
    ) -> Result<RenderAttachment> {
        self.layout.add_attachment(
            kind,
            format,
            (initial_layout, final_layout),
            load_op,
            store_op,
        )
    }

    /// Append a subpass, sealing it, and return its index.
    pub fn add_subpass(
        &mut self,
        subpass: &mut SubPass,
        flags: vk::SubpassDescriptionFlags,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<u32> {
        self.layout.add_subpass(subpass, flags, bind_point)
    }

    /// Append a dependency between two subpasses (or `vk::SUBPASS_EXTERNAL`).
    pub fn add_subpass_dependency(&mut self, dependency: vk::SubpassDependency) -> Result<()> {
        self.layout.add_dependency(dependency)
    }

    /// Create the native render pass. Must be called exactly once.
    pub fn finalize(&mut self) -> Result<()> {
        if self.layout.sealed {
            return Err(GpuError::InvalidState(
                "render pass already finalized".to_string(),
            ));
        }
        if self.layout.subpasses.is_empty() {
            return Err(GpuError::InvalidConfig(
                "render pass needs at least one subpass".to_string(),
            ));
        }

        let subpasses: Vec<vk::SubpassDescription<'_>> = self
            .layout
            .subpasses
            .iter()
            .map(SubpassData::description)
            .collect();
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&self.layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.layout.dependencies);

        // SAFETY: every slice referenced by the create info lives in `self.layout`.
        let handle = unsafe { self.device.handle().create_render_pass(&create_info, None) }?;
        debug!(
            "Created render pass {handle:?}: {} attachments, {} subpasses",
            self.layout.attachments.len(),
            subpasses.len()
        );

        self.handle = handle;
        self.layout.sealed = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.layout.sealed
    }

    /// Native handle; null until [`finalize`](Self::finalize) succeeds.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.layout.samples
    }

    pub fn attachment_count(&self) -> usize {
        self.layout.attachments.len()
    }

    pub fn subpass_count(&self) -> usize {
        self.layout.subpasses.len()
    }

    /// Number of color attachments written by `subpass`.
    pub fn color_attachment_count(&self, subpass: u32) -> usize {
        self.layout
            .subpasses
            .get(subpass as usize)
            .map_or(0, |s| s.colors.len())
    }

    /// Whether any subpass uses a depth-stencil attachment.
    pub fn has_depth_stencil(&self) -> bool {
        self.layout.has_depth_stencil
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if self.handle != vk::RenderPass::null() {
            // SAFETY: the render pass is owned exclusively.
            unsafe { self.device.handle().destroy_render_pass(self.handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(layout: &mut PassLayout, kind: AttachmentType) -> RenderAttachment {
        layout
            .add_attachment(
                kind,
                vk::Format::B8G8R8A8_UNORM,
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            )
            .unwrap()
    }

    #[test]
    fn multisampling_only_applies_to_color_and_depth() {
        let mut layout = PassLayout::new(vk::SampleCountFlags::TYPE_4);
        let color = attach(&mut layout, AttachmentType::Color);
        let depth = attach(&mut layout, AttachmentType::Depth);
        let resolve = attach(&mut layout, AttachmentType::Resolve);
        let input = attach(&mut layout, AttachmentType::Input);

        assert_eq!((color.index(), depth.index(), resolve.index(), input.index()), (0, 1, 2, 3));
        let samples: Vec<_> = layout.attachments.iter().map(|a| a.samples).collect();
        assert_eq!(
            samples,
            vec![
                vk::SampleCountFlags::TYPE_4,
                vk::SampleCountFlags::TYPE_4,
                vk::SampleCountFlags::TYPE_1,
                vk::SampleCountFlags::TYPE_1,
            ]
        );
    }

    #[test]
    fn subpass_references_get_default_layouts() {
        let mut layout = PassLayout::new(vk::SampleCountFlags::TYPE_1);
        let color = attach(&mut layout, AttachmentType::Color);
        let depth = attach(&mut layout, AttachmentType::Depth);
        let input = attach(&mut layout, AttachmentType::Input);

        let mut subpass = SubPass::new();
        subpass
            .add_attachment(&color, None)
            .add_attachment(&depth, None)
            .add_attachment(&input, Some(vk::ImageLayout::GENERAL));

        assert_eq!(
            subpass.colors[0].layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            subpass.depth.map(|d| d.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );
        assert_eq!(subpass.inputs[0].layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn adding_a_subpass_seals_it_and_records_depth() {
        let mut layout = PassLayout::new(vk::SampleCountFlags::TYPE_1);
        let color = attach(&mut layout, AttachmentType::Color);
        let depth = attach(&mut layout, AttachmentType::Depth);

        let mut first = SubPass::new();
        first.add_attachment(&color, None);
        let index = layout
            .add_subpass(
                &mut first,
                vk::SubpassDescriptionFlags::empty(),
                vk::PipelineBindPoint::GRAPHICS,
            )
            .unwrap();
        assert_eq!(index, 0);
        assert!(first.is_finalized());
        assert!(!layout.has_depth_stencil);

        // Ignored: the subpass is sealed.
        first.add_attachment(&depth, None);
        assert!(!first.has_depth());

        let mut second = SubPass::new();
        second.add_attachment(&color, None).add_attachment(&depth, None);
        let index = layout
            .add_subpass(
                &mut second,
                vk::SubpassDescriptionFlags::empty(),
                vk::PipelineBindPoint::GRAPHICS,
            )
            .unwrap();
        assert_eq!(index, 1);
        assert!(layout.has_depth_stencil);

        assert!(layout
            .add_subpass(
                &mut first,
                vk::SubpassDescriptionFlags::empty(),
                vk::PipelineBindPoint::GRAPHICS,
            )
            .is_err());
    }

    #[test]
    fn dependencies_must_reference_known_subpasses() {
        let mut layout = PassLayout::new(vk::SampleCountFlags::TYPE_1);
        let color = attach(&mut layout, AttachmentType::Color);
        let mut subpass = SubPass::new();
        subpass.add_attachment(&color, None);
        layout
            .add_subpass(
                &mut subpass,
                vk::SubpassDescriptionFlags::empty(),
                vk::PipelineBindPoint::GRAPHICS,
            )
            .unwrap();

        let external = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0);
        assert!(layout.add_dependency(external).is_ok());
        let dangling = vk::SubpassDependency::default().src_subpass(0).dst_subpass(3);
        assert!(matches!(
            layout.add_dependency(dangling),
            Err(GpuError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sealed_layout_rejects_additions() {
        let mut layout = PassLayout::new(vk::SampleCountFlags::TYPE_1);
        layout.sealed = true;
        assert!(matches!(
            layout.add_attachment(
                AttachmentType::Color,
                vk::Format::R8G8B8A8_UNORM,
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
            ),
            Err(GpuError::InvalidState(_))
        ));
        assert!(layout
            .add_dependency(vk::SubpassDependency::default())
            .is_err());
    }
}
