mod mux;
mod record_replay;
mod shaping;
mod support;
