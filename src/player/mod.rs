// 播放器核心模块

pub mod audio_output;
pub mod decoder;
pub mod demuxer_thread;
pub mod input_stream;
pub mod manager;
pub mod packet_queue;
pub mod sink;

pub use audio_output::CpalAudioSink;
pub use decoder::{AudioDecode, VideoDecode};
pub use input_stream::{
    sanitize_input_url, FfmpegInputFactory, InputFactory, InputStream, InterruptFlags,
    MediaPacket, PacketKind,
};
pub use manager::LiveStreamPlayer;
pub use packet_queue::{OverflowPolicy, PacketQueue};
pub use sink::{AudioSink, FrameSink, PlayerSinks, StatsSink, StatusSink};
