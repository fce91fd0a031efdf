//! Format frontends for the pipeline.
//!
//! The IAGA-2002 text reader and the StationXML inventory reader are
//! implemented here; binary waveform (MiniSEED) and spectrogram (CDF)
//! decoding stay outside the core behind the [`seismic::TraceProvider`]
//! and [`vlf::SpectrogramProvider`] traits, which yield the canonical
//! in-memory forms the stages consume.

pub mod iaga;
pub mod seismic;
pub mod stationxml;
pub mod vlf;
