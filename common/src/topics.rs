pub const TOPIC_MUX_COMMAND: &str = "hdmi_mux";
pub const TOPIC_MUX_STATE: &str = "hdmi_mux/state";
