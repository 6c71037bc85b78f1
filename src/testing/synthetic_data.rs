//! Synthetic frames and device lists
//!
//! Lets the whole lifecycle run offline: frames are deterministic gradients
//! and device lists mimic what real laptops report (integrated camera first,
//! a microphone mixed in, USB cameras after).

use crate::types::{CameraFrame, DeviceRecord};

/// Create a synthetic RGB frame
///
/// The gradient shifts with `frame_number` so consecutive frames differ.
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> CameraFrame {
    let mut data = vec![0u8; (width as usize) * (height as usize) * 3];

    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y as usize) * (width as usize) + x as usize) * 3;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }

    CameraFrame::new(data, width, height, "synthetic".to_string())
}

/// `count` video devices labelled "Camera 0", "Camera 1", ...
pub fn video_devices(count: usize) -> Vec<DeviceRecord> {
    (0..count)
        .map(|i| DeviceRecord::video(format!("video-{}", i), format!("Camera {}", i)))
        .collect()
}

/// A typical laptop: integrated camera, microphone, one USB camera.
pub fn laptop_devices() -> Vec<DeviceRecord> {
    vec![
        DeviceRecord::video("integrated", "Integrated Camera (04f2:b6d9)"),
        DeviceRecord::audio("mic", "Built-in Microphone"),
        DeviceRecord::video("usb-front", "USB FrontCam HD"),
    ]
}
