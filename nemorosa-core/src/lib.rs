/// The current application version of nemorosa.
pub const VERSION: &str = "0.9.0";

pub mod cache;
pub mod client;
pub mod config;
pub mod ledger;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod search;
pub mod torrent;
pub mod trackers;

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use log4rs::Config;
    use sha1::{Digest, Sha1};
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Initializes the logger with the specified log level.
    #[macro_export]
    macro_rules! init_logger {
        ($level:expr) => {
            $crate::testing::init_logger_level($level)
        };
        () => {
            $crate::testing::init_logger_level(log::LevelFilter::Trace)
        };
    }

    /// Initializes the logger with the specified log level.
    pub fn init_logger_level(level: LevelFilter) {
        INIT.call_once(|| {
            log4rs::init_config(
                Config::builder()
                    .appender(Appender::builder().build("stdout", Box::new(ConsoleAppender::builder()
                        .encoder(Box::new(PatternEncoder::new("\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[37m---\x1B[0m \x1B[37m[{T:>15.15}]\x1B[0m \x1B[36m{t:<40.40}\x1B[0m \x1B[37m:\x1B[0m {m}{n}")))
                        .build())))
                    .logger(Logger::builder().build("httpmock", LevelFilter::Warn))
                    .logger(Logger::builder().build("hyper", LevelFilter::Info))
                    .logger(Logger::builder().build("reqwest", LevelFilter::Info))
                    .build(Root::builder().appender("stdout").build(level))
                    .unwrap(),
            )
            .unwrap();
        })
    }

    /// Hash the given content into SHA1 piece digests of the given piece length.
    pub fn hash_pieces(content: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
        content
            .chunks(piece_length)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect()
    }

    /// Concatenate the given piece digests into a metainfo `pieces` byte string.
    pub fn pieces_bytes(pieces: &[[u8; 20]]) -> Vec<u8> {
        pieces.iter().flat_map(|e| e.iter().copied()).collect()
    }

    /// Build a canonical multi file test torrent with the given files and content.
    pub fn multi_file_torrent(
        name: &str,
        piece_length: u64,
        files: &[(&str, &[u8])],
        source: Option<&str>,
    ) -> Vec<u8> {
        use serde_bencode::value::Value;
        use std::collections::HashMap;

        let content: Vec<u8> = files
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();
        let pieces = pieces_bytes(&hash_pieces(&content, piece_length as usize));

        let file_values: Vec<Value> = files
            .iter()
            .map(|(path, data)| {
                let mut file = HashMap::new();
                file.insert(b"length".to_vec(), Value::Int(data.len() as i64));
                file.insert(
                    b"path".to_vec(),
                    Value::List(
                        path.split('/')
                            .map(|e| Value::Bytes(e.as_bytes().to_vec()))
                            .collect(),
                    ),
                );
                Value::Dict(file)
            })
            .collect();

        let mut info = HashMap::new();
        info.insert(b"files".to_vec(), Value::List(file_values));
        info.insert(b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        if let Some(source) = source {
            info.insert(b"source".to_vec(), Value::Bytes(source.as_bytes().to_vec()));
        }

        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(b"https://flacsfor.me/123abc/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        serde_bencode::to_bytes(&Value::Dict(root)).unwrap()
    }

    /// Build a canonical single file test torrent.
    pub fn single_file_torrent(name: &str, piece_length: u64, content: &[u8]) -> Vec<u8> {
        use serde_bencode::value::Value;
        use std::collections::HashMap;

        let pieces = pieces_bytes(&hash_pieces(content, piece_length as usize));

        let mut info = HashMap::new();
        info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
        info.insert(b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));

        let mut root = HashMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));

        serde_bencode::to_bytes(&Value::Dict(root)).unwrap()
    }
}
