// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Images, views, the shared depth attachment and framebuffers form one unit
// that is rebuilt wholesale; nothing in it is patched in place.

use ash::vk;
use std::sync::Arc;

use super::image::{depth_aspect, GpuImage};
use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

/// Prefer 8-bit sRGB with a non-linear color space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            (f.format == vk::Format::B8G8R8A8_SRGB || f.format == vk::Format::R8G8B8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` when the surface offers it, else FIFO (always supported).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's fixed extent if it reports one, else the request clamped into bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, clamped to the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}

/// Ring index over frames in flight, independent of the acquired image index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRing {
    current: usize,
    len: usize,
}

impl FrameRing {
    pub fn new(len: usize) -> Self {
        Self {
            current: 0,
            len: len.max(1),
        }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.len
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.len;
    }
}

/// Everything derived from one swapchain handle
struct SwapchainTargets {
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: GpuImage,
    framebuffers: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl SwapchainTargets {
    fn destroy_framebuffers(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

impl Drop for SwapchainTargets {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
        }
    }
}

/// Outcome of a present call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Stale swapchain was rebuilt
    Recreated,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    preferred_present_mode: vk::PresentModeKHR,
    targets: Option<SwapchainTargets>,
    render_pass: vk::RenderPass,
    requested_extent: (u32, u32),
    generation: u64,
    frames: FrameRing,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
        max_frames_in_flight: usize,
    ) -> BackendResult<Self> {
        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            preferred_present_mode,
            targets: None,
            render_pass: vk::RenderPass::null(),
            requested_extent: (width, height),
            generation: 0,
            frames: FrameRing::new(max_frames_in_flight),
            device,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Bumped on every successful (re)creation; dependents compare it to
    /// decide whether to rebuild themselves.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.targets.as_ref().map_or(0, |t| t.images.len())
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.frames.current()
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.targets
            .as_ref()
            .and_then(|t| t.framebuffers.get(image_index as usize).copied())
            .unwrap_or_default()
    }

    pub fn depth_format(&self) -> vk::Format {
        self.device.depth_format
    }

    /// Destroy and rebuild the whole swapchain for a new size.
    ///
    /// Returns `false` and builds nothing when the surface extent is zero.
    pub fn recreate(&mut self, width: u32, height: u32) -> BackendResult<bool> {
        self.requested_extent = (width, height);
        self.device.wait_idle()?;
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> BackendResult<bool> {
        let support = self.device.query_swapchain_support()?;
        let caps = support.capabilities;

        // Known even while minimized so render passes can be built against it
        let format = choose_surface_format(&support.formats).ok_or(BackendError::NoSurfaceFormat)?;
        self.format = format;

        let extent = choose_extent(&caps, width, height);
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Surface extent is zero, swapchain creation deferred");
            return Ok(false);
        }

        let present_mode = choose_present_mode(&support.present_modes, self.preferred_present_mode);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}, {} images requested",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count
        );

        let families = self.device.queue_families;
        let family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.device.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        create_info = if families.graphics != families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let new_swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;

        // Old derived set goes first, then the retired handle
        self.targets = None;
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = new_swapchain;
        self.extent = extent;
        self.present_mode = present_mode;

        let images = unsafe { self.swapchain_loader.get_swapchain_images(new_swapchain) }?;
        let image_views = images
            .iter()
            .map(|&image| self.create_image_view(image, format.format))
            .collect::<BackendResult<Vec<_>>>()?;

        let depth = GpuImage::new(
            self.device.clone(),
            "depth attachment",
            extent,
            self.device.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(self.device.depth_format),
        )?;

        log::info!("Created swapchain with {} images", images.len());

        self.targets = Some(SwapchainTargets {
            images,
            image_views,
            depth,
            framebuffers: Vec::new(),
            device: self.device.clone(),
        });

        if self.render_pass != vk::RenderPass::null() {
            self.create_framebuffers()?;
        }

        self.generation += 1;
        Ok(true)
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> BackendResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.device.create_image_view(&create_info, None) }?;
        Ok(view)
    }

    /// Bind the render pass the framebuffers are built against and (re)create them.
    pub fn attach_render_pass(&mut self, render_pass: vk::RenderPass) -> BackendResult<()> {
        self.render_pass = render_pass;
        self.create_framebuffers()
    }

    fn create_framebuffers(&mut self) -> BackendResult<()> {
        let extent = self.extent;
        let render_pass = self.render_pass;
        let Some(targets) = self.targets.as_mut() else {
            return Ok(());
        };
        targets.destroy_framebuffers();

        for &view in &targets.image_views {
            let attachments = [view, targets.depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }?;
            targets.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Acquire the next image.
    ///
    /// `Ok(None)` means the swapchain was stale and has been rebuilt with the
    /// last requested extent; the caller skips this frame.
    pub fn acquire_next_image_index(
        &mut self,
        timeout: u64,
        image_available: vk::Semaphore,
        fence: vk::Fence,
    ) -> BackendResult<Option<u32>> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, timeout, image_available, fence)
        };

        match result {
            // Suboptimal still hands out a usable image
            Ok((index, _suboptimal)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date on acquire, recreating");
                let (width, height) = self.requested_extent;
                self.recreate(width, height)?;
                Ok(None)
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                log::warn!("No swapchain image available within {} ns", timeout);
                Ok(None)
            }
            Err(e) => {
                log::error!("Failed to acquire swapchain image: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Present `image_index` once `render_complete` signals.
    ///
    /// The frame ring advances whatever the outcome.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        render_complete: vk::Semaphore,
        image_index: u32,
    ) -> BackendResult<PresentOutcome> {
        let wait_semaphores = [render_complete];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };
        self.frames.advance();

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain stale on present, recreating");
                let (width, height) = self.requested_extent;
                self.recreate(width, height)?;
                Ok(PresentOutcome::Recreated)
            }
            Err(e) => {
                log::error!("Failed to present swapchain image: {:?}", e);
                Err(e.into())
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.targets = None;
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_prefers_srgb_format() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_falls_back_to_first_format() {
        let formats = [
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            surface_format(vk::Format::R16G16B16A16_SFLOAT),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_fixed_extent_wins() {
        let extent = choose_extent(&caps(2, 3, (800, 600)), 1024, 768);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_extent_clamped_when_surface_flexible() {
        let extent = choose_extent(&caps(2, 3, (u32::MAX, u32::MAX)), 8000, 600);
        assert_eq!((extent.width, extent.height), (4096, 600));
    }

    #[test]
    fn test_image_count() {
        assert_eq!(choose_image_count(&caps(2, 0, (1, 1))), 3);
        assert_eq!(choose_image_count(&caps(2, 2, (1, 1))), 2);
        assert_eq!(choose_image_count(&caps(1, 8, (1, 1))), 2);
    }

    #[test]
    fn test_frame_ring_wraps() {
        let mut ring = FrameRing::new(2);
        assert_eq!(ring.current(), 0);
        ring.advance();
        assert_eq!(ring.current(), 1);
        ring.advance();
        assert_eq!(ring.current(), 0);
        assert_eq!(FrameRing::new(0).slots(), 1);
    }
}
