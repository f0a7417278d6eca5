#[cfg(not(windows))]
mod fuzz {
    use std::{io, sync::Arc};

    use fvmsparse::{format::sparse, stream::ReadAt};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Arc::new(data.to_vec());

                if let Ok(descriptor) = sparse::read_image(reader.clone(), 0) {
                    let mut buf = [0u8; 4096];

                    for partition in &descriptor.partitions {
                        for mapping in &partition.address.mappings {
                            let n = mapping.count.min(buf.len() as u64) as usize;
                            let _ = partition.reader.read_exact_at(&mut buf[..n], mapping.source);
                        }
                    }
                }

                let _ = sparse::decompress_to_file(&*reader, io::sink());
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
