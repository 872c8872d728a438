//! Real-time duplex audio client for Gemini Live, plus the one-shot
//! studio requests (image, video, analysis).

pub mod audio;
pub mod capture;
pub mod codec;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod gemini;
pub mod playback;
pub mod resample;
pub mod settings;
pub mod studio;
pub mod transport;
pub mod visualizer;
