// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Swapchains: rotating sets of GPU-importable images. Acquisition is
//! strict FIFO, oldest released image first. Destruction is deferred:
//! carcasses travel over a channel to the render task, which drops them at
//! the top of a tick, after any in-flight composite has finished with them.

use std::{collections::VecDeque, os::fd::OwnedFd, sync::Arc};

use xrd_protocol::SwapchainCreate;

use crate::error::SessionError;

/// Images per swapchain, server-side cap.
pub const MAX_IMAGES: u32 = 8;
/// Largest accepted image extent on either axis.
pub const MAX_IMAGE_EXTENT: u32 = 8192;

/// The image memory set backing one swapchain. The layer stacks that
/// reference it hold clones, so a carcass on the GC channel can't pull
/// memory out from under the compositor.
pub struct SwapchainImages {
    pub info: SwapchainCreate,
    pub fds: Vec<OwnedFd>,
}

/// Allocates exportable image memory. Real GPU allocators live behind the
/// renderer; the built-in one backs images with memfds.
pub trait ImageAllocator: Send + Sync {
    fn allocate(&self, info: &SwapchainCreate) -> anyhow::Result<Vec<OwnedFd>>;
}

pub struct MemfdAllocator {}

impl ImageAllocator for MemfdAllocator {
    fn allocate(&self, info: &SwapchainCreate) -> anyhow::Result<Vec<OwnedFd>> {
        use anyhow::Context;

        // Tightly packed RGBA8; a real renderer would consult the format.
        let size = info.width as u64 * info.height as u64 * 4 * info.array_size.max(1) as u64;

        (0..info.image_count)
            .map(|i| {
                let fd = rustix::fs::memfd_create(
                    format!("xrd-image-{i}"),
                    rustix::fs::MemfdFlags::CLOEXEC,
                )
                .context("memfd_create")?;
                rustix::fs::ftruncate(&fd, size).context("ftruncate")?;

                Ok(fd)
            })
            .collect()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ImageState {
    Released,
    Acquired,
    Waited,
}

pub struct Swapchain {
    pub images: Arc<SwapchainImages>,

    states: Vec<ImageState>,
    /// Released images, oldest first.
    fifo: VecDeque<u32>,
    /// Acquired images in acquisition order, for wait/release pairing.
    in_use: VecDeque<u32>,
    last_released: Option<u32>,
}

impl Swapchain {
    pub fn new(images: Arc<SwapchainImages>) -> Self {
        let count = images.info.image_count;

        Self {
            images,
            states: vec![ImageState::Released; count as usize],
            fifo: (0..count).collect(),
            in_use: VecDeque::new(),
            last_released: None,
        }
    }

    pub fn image_count(&self) -> u32 {
        self.images.info.image_count
    }

    /// The image a layer submitted right now would show.
    pub fn last_released(&self) -> Option<u32> {
        self.last_released
    }

    /// Takes the oldest released image.
    pub fn acquire(&mut self) -> Result<u32, SessionError> {
        let index = self.fifo.pop_front().ok_or_else(|| {
            SessionError::call_order("all swapchain images are already acquired")
        })?;

        self.states[index as usize] = ImageState::Acquired;
        self.in_use.push_back(index);

        Ok(index)
    }

    /// Waits for the oldest acquired image's fence. A zero timeout is a
    /// non-blocking poll. Memfd-backed images are ready the moment they're
    /// acquired, so every wait completes immediately here; a GPU-backed
    /// allocator would park on the fence up to `timeout_ns` and report
    /// `Timeout` on expiry.
    pub fn wait(&mut self, _timeout_ns: i64) -> Result<(), SessionError> {
        let index = self
            .in_use
            .iter()
            .copied()
            .find(|&i| self.states[i as usize] == ImageState::Acquired)
            .ok_or_else(|| SessionError::call_order("no acquired image to wait on"))?;

        self.states[index as usize] = ImageState::Waited;

        Ok(())
    }

    /// Returns the oldest waited image to the FIFO.
    pub fn release(&mut self) -> Result<u32, SessionError> {
        let pos = self
            .in_use
            .iter()
            .position(|&i| self.states[i as usize] == ImageState::Waited)
            .ok_or_else(|| SessionError::call_order("no waited image to release"))?;

        let index = self.in_use.remove(pos).unwrap();
        self.states[index as usize] = ImageState::Released;
        self.fifo.push_back(index);
        self.last_released = Some(index);

        Ok(index)
    }
}

/// What a destroyed swapchain leaves behind for the render task.
pub struct SwapchainCarcass {
    pub client_id: u64,
    pub swapchain_id: u64,
    pub images: Arc<SwapchainImages>,
}

pub fn validate_create_info(info: &SwapchainCreate) -> Result<(), SessionError> {
    if info.width == 0
        || info.height == 0
        || info.width > MAX_IMAGE_EXTENT
        || info.height > MAX_IMAGE_EXTENT
    {
        return Err(SessionError::validation(format!(
            "invalid swapchain extent {}x{}",
            info.width, info.height
        )));
    }

    if info.image_count == 0 || info.image_count > MAX_IMAGES {
        return Err(SessionError::validation(format!(
            "invalid image count {}",
            info.image_count
        )));
    }

    if info.sample_count == 0 || info.array_size == 0 || info.mip_count == 0 {
        return Err(SessionError::validation("zero-sized swapchain attribute"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain(image_count: u32) -> Swapchain {
        let info = SwapchainCreate {
            width: 64,
            height: 64,
            format: 0,
            sample_count: 1,
            array_size: 1,
            mip_count: 1,
            image_count,
        };

        let fds = MemfdAllocator {}.allocate(&info).unwrap();
        Swapchain::new(Arc::new(SwapchainImages { info, fds }))
    }

    #[test]
    fn fifo_rotation() {
        let mut chain = test_chain(3);

        // Repeated acquire/wait/release cycles the indices in order.
        let mut seen = Vec::new();
        for _ in 0..6 {
            let index = chain.acquire().unwrap();
            chain.wait(-1).unwrap();
            chain.release().unwrap();
            seen.push(index);
        }

        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn acquire_exhaustion() {
        let mut chain = test_chain(2);

        chain.acquire().unwrap();
        chain.acquire().unwrap();

        assert!(matches!(
            chain.acquire(),
            Err(SessionError::CallOrder(_))
        ));

        // Releasing one allows another acquire.
        chain.wait(-1).unwrap();
        chain.release().unwrap();
        assert_eq!(chain.acquire().unwrap(), 0);
    }

    #[test]
    fn wait_requires_acquire() {
        let mut chain = test_chain(2);
        assert!(matches!(chain.wait(-1), Err(SessionError::CallOrder(_))));
    }

    #[test]
    fn zero_timeout_wait_is_a_poll() {
        let mut chain = test_chain(2);
        chain.acquire().unwrap();

        // Ready images satisfy a non-blocking poll immediately.
        chain.wait(0).unwrap();
        chain.release().unwrap();
    }

    #[test]
    fn release_requires_wait() {
        let mut chain = test_chain(2);
        chain.acquire().unwrap();

        assert!(matches!(chain.release(), Err(SessionError::CallOrder(_))));
    }

    #[test]
    fn last_released_tracks_composite_source() {
        let mut chain = test_chain(3);
        assert_eq!(chain.last_released(), None);

        chain.acquire().unwrap();
        chain.wait(-1).unwrap();
        chain.release().unwrap();
        assert_eq!(chain.last_released(), Some(0));

        chain.acquire().unwrap();
        chain.wait(-1).unwrap();
        chain.release().unwrap();
        assert_eq!(chain.last_released(), Some(1));
    }

    #[test]
    fn images_survive_via_arc() {
        let mut chain = test_chain(2);
        chain.acquire().unwrap();

        let in_flight = chain.images.clone();
        let carcass = SwapchainCarcass {
            client_id: 1,
            swapchain_id: 2,
            images: chain.images.clone(),
        };
        drop(chain);

        // The compositor's reference keeps the memory alive until the GC
        // drain drops the carcass.
        assert_eq!(Arc::strong_count(&in_flight), 2);
        drop(carcass);
        assert_eq!(Arc::strong_count(&in_flight), 1);
    }
}
