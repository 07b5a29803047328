// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::{
        io::Cursor,
        sync::atomic::AtomicBool,
    };

    use honggfuzz::fuzz;
    use img2sdat::{
        format::sparse::CrcMode,
        image::{BlockImage, SparseImage},
        stream::MutexFile,
    };

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);

        loop {
            fuzz!(|data: &[u8]| {
                let file = MutexFile::new(Cursor::new(data));

                if let Ok(image) = SparseImage::open(file, 4096, CrcMode::Validate, &cancel_signal)
                    && let Some(block) = image.care_map().min_block()
                {
                    let mut buf = vec![0u8; image.block_size() as usize];
                    let _ = image.read_block(block, &mut buf);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
