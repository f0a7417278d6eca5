#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use fvmsparse::{format::fvm::Metadata, stream::FromReader};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Cursor::new(data);
                if let Ok(metadata) = Metadata::from_reader(reader) {
                    let _ = metadata.validate();
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
