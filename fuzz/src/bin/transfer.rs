// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use img2sdat::format::transfer::TransferList;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let Ok(text) = std::str::from_utf8(data) else {
                    return;
                };

                // Whatever parses must be rendered back to an equivalent list.
                if let Ok(list) = text.parse::<TransferList>() {
                    let reparsed = list.to_string().parse::<TransferList>();
                    assert_eq!(reparsed.ok(), Some(list));
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
