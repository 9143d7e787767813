// Image layout transitions
//
// Every legal (old, new) layout pair maps to exactly one barrier tuple.
// An unmapped pair is a configuration error and fails loudly: a wrong
// barrier is a correctness bug that may not manifest until much later.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::command::submit_once;
use super::VulkanDevice;

/// The exact pipeline-barrier parameters for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPlan {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier parameters for `(old, new)`.
///
/// Returns `Ok(None)` when the layouts are equal (no barrier needed) and an
/// error for a pair the table does not cover.
pub fn plan(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Option<BarrierPlan>> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    if old == new {
        return Ok(None);
    }

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        // Fresh images: contents are undefined, nothing to wait for.
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::UNDEFINED, L::TRANSFER_SRC_OPTIMAL) => {
            (A::empty(), A::TRANSFER_READ, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_READ_ONLY_OPTIMAL) => {
            (A::empty(), A::SHADER_READ, S::TOP_OF_PIPE, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::empty(), A::SHADER_READ, S::TOP_OF_PIPE, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::GENERAL) => (
            A::empty(),
            A::SHADER_READ | A::SHADER_WRITE,
            S::TOP_OF_PIPE,
            S::COMPUTE_SHADER,
        ),
        (L::UNDEFINED, L::PRESENT_SRC_KHR) => {
            (A::empty(), A::empty(), S::TOP_OF_PIPE, S::BOTTOM_OF_PIPE)
        }

        // Transfer destinations hand off to sampling, presentation or blits.
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => {
            (A::TRANSFER_WRITE, A::empty(), S::TRANSFER, S::BOTTOM_OF_PIPE)
        }
        (L::TRANSFER_DST_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::COLOR_ATTACHMENT_WRITE,
            S::TRANSFER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),

        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::TRANSFER_READ, A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER)
        }

        // Colour attachment hand-offs.
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::empty(),
            S::COLOR_ATTACHMENT_OUTPUT,
            S::BOTTOM_OF_PIPE,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::FRAGMENT_SHADER,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::TRANSFER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::TRANSFER,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::TRANSFER_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::TRANSFER,
        ),

        // Reacquiring a presented image. Presentation performs its own
        // visibility operations, so there is nothing to flush.
        (L::PRESENT_SRC_KHR, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::PRESENT_SRC_KHR, L::TRANSFER_SRC_OPTIMAL) => {
            (A::empty(), A::TRANSFER_READ, S::TOP_OF_PIPE, S::TRANSFER)
        }

        // Sampled images going back to writable uses.
        (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::SHADER_READ,
            A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_WRITE, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_READ, S::FRAGMENT_SHADER, S::TRANSFER)
        }

        // Depth attachment <-> sampled depth.
        (L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, L::DEPTH_STENCIL_READ_ONLY_OPTIMAL) => (
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::LATE_FRAGMENT_TESTS,
            S::FRAGMENT_SHADER,
        ),
        (L::DEPTH_STENCIL_READ_ONLY_OPTIMAL, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::SHADER_READ,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            S::EARLY_FRAGMENT_TESTS,
        ),

        // Storage images <-> sampled images.
        (L::GENERAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::SHADER_WRITE, A::SHADER_READ, S::COMPUTE_SHADER, S::FRAGMENT_SHADER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::GENERAL) => (
            A::SHADER_READ,
            A::SHADER_READ | A::SHADER_WRITE,
            S::FRAGMENT_SHADER,
            S::COMPUTE_SHADER,
        ),

        (old, new) => bail!("Unmapped image layout transition: {:?} -> {:?}", old, new),
    };

    Ok(Some(BarrierPlan {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }))
}

/// Aspect mask for a format: depth, depth+stencil, or colour.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Number of mip levels for a full chain over a `width` x `height` image.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Record a single layout-transition barrier into `cmd`.
///
/// No-op when the layouts are equal; errors on an unmapped pair.
pub fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let Some(plan) = plan(old, new)? else {
        return Ok(());
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(plan.src_access)
        .dst_access_mask(plan.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            plan.src_stage,
            plan.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

/// Transition an image and block until the GPU has executed the barrier.
///
/// Records on a short-lived, immediately submitted command buffer so the
/// calling thread observes the transition as complete on return. The tracked
/// layout is updated only after the barrier is recorded.
pub fn transition_image(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    queue: vk::Queue,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    layout: &mut vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    if *layout == new_layout {
        return Ok(());
    }
    // Validate the pair before paying for a submission.
    plan(*layout, new_layout)?;

    let old = *layout;
    submit_once(device, pool, queue, |cmd| {
        record_barrier(&device.device, cmd, image, format, mip_levels, old, new_layout)
    })
    .context("Layout transition submission failed")?;

    *layout = new_layout;
    Ok(())
}

/// Generate a full mip chain by successive blits.
///
/// Each level is blitted from the previous one through a
/// TRANSFER_DST -> TRANSFER_SRC barrier and finishes in SHADER_READ_ONLY;
/// the tracked layout is force-set at the end, bypassing the table for this
/// one multi-step sequence. The image must currently be TRANSFER_DST with
/// every level allocated.
pub fn generate_mipmaps(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    queue: vk::Queue,
    image: vk::Image,
    format: vk::Format,
    width: u32,
    height: u32,
    mip_levels: u32,
    layout: &mut vk::ImageLayout,
) -> Result<()> {
    if !device.supports_linear_blit(format) {
        bail!("Format {:?} does not support linear blitting for mip generation", format);
    }

    submit_once(device, pool, queue, |cmd| {
        let aspect = aspect_mask(format);
        let mut barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        let mut mip_width = width as i32;
        let mut mip_height = height as i32;

        for level in 1..mip_levels {
            // Previous level: written by the last copy/blit, becomes the
            // blit source.
            barrier.subresource_range.base_mip_level = level - 1;
            barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            barrier.dst_access_mask = vk::AccessFlags::TRANSFER_READ;

            unsafe {
                device.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }

            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: mip_width,
                        y: mip_height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };

            unsafe {
                device.device.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            // Source level is finished; make it sampleable.
            barrier.old_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_READ;
            barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

            unsafe {
                device.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }

            mip_width = next_width;
            mip_height = next_height;
        }

        // Last level never became a blit source.
        barrier.subresource_range.base_mip_level = mip_levels - 1;
        barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
        barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        Ok(())
    })
    .context("Mip generation submission failed")?;

    *layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_LAYOUTS: [vk::ImageLayout; 9] = [
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::ImageLayout::GENERAL,
    ];

    #[test]
    fn identity_transition_is_a_no_op() {
        for layout in ALL_LAYOUTS {
            assert_eq!(plan(layout, layout).unwrap(), None);
        }
    }

    #[test]
    fn exercised_pairs_are_mapped_and_deterministic() {
        let pairs = [
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
        ];
        for (old, new) in pairs {
            let first = plan(old, new).unwrap().unwrap();
            let second = plan(old, new).unwrap().unwrap();
            assert_eq!(first, second);
            // A mapped transition always orders something.
            assert_ne!(
                (first.src_stage, first.dst_stage),
                (vk::PipelineStageFlags::empty(), vk::PipelineStageFlags::empty())
            );
        }
    }

    #[test]
    fn unmapped_pair_fails_loudly() {
        let err = plan(
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unmapped image layout transition"));
    }

    #[test]
    fn transfer_write_is_made_visible_to_sampling() {
        let plan = plan(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap()
        .unwrap();
        assert_eq!(plan.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(plan.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(plan.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(plan.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_mask(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(1000, 600), 10);
    }
}
