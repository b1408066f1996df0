use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("无法打开流: {0}")]
    OpenError(String),

    #[error("无法找到视频流")]
    NoVideoStream,

    #[error("解码器初始化失败: {0}")]
    CodecSetupError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
