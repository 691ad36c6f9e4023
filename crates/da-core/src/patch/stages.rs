//! Patch tables for the first and second DA stages.

use super::{Candidate, Edit, PatchReport, PatchTable, PatchTarget, Pattern, apply_patches};

fn le(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

/// Error word 0xC0020039: DA version check in the first stage.
pub fn first_stage_table(load_address: u32) -> PatchTable {
    PatchTable {
        targets: vec![PatchTarget::new(
            "da_version_check",
            vec![Candidate::new(
                Pattern::exact(&[0x1F, 0xB5, 0x00, 0x23, 0x01, 0xA8, 0x00, 0x93, 0x00, 0xF0]),
                // movs r0, #0; bx lr
                Edit::replace(&[0x00, 0x20, 0x70, 0x47]),
            )],
        )],
        load_address,
    }
}

pub fn second_stage_table(load_address: u32) -> PatchTable {
    const VENDOR_MARKERS: &[&[u8]] = &[b"[oplus]", b"[OPPO]"];
    let flag_tail = |head: [u8; 4]| {
        let mut bytes = head.to_vec();
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.push(0x03);
        bytes
    };

    let targets = vec![
        PatchTarget::new(
            "rma_state",
            vec![Candidate::new(
                Pattern::exact(&[0x01, 0x2B, 0x03, 0xD1, 0x01, 0x23]),
                Edit::replace(&[0; 4]),
            )],
        ),
        PatchTarget::new(
            "vendor_auth_status",
            vec![
                Candidate::new(
                    Pattern::masked(&[0x0A, 0x00, 0x00, 0xE0, 0x00, 0x00, 0x00, 0xE0], &[4]),
                    Edit::FlagPointer { expect: 3, value: 1 },
                ),
                Candidate::new(
                    Pattern::exact(&flag_tail([0xFF; 4])),
                    Edit::replace_at(0x10, &[0x01]),
                ),
                Candidate::new(
                    Pattern::exact(&flag_tail([0x63, 0x88, 0x74, 0x18])),
                    Edit::replace_at(0x10, &[0x01]),
                ),
            ],
        )
        .when_marked(VENDOR_MARKERS),
        PatchTarget::new(
            "vendor_security",
            vec![
                Candidate::new(
                    Pattern::exact(&[0x01, 0x3B, 0x01, 0x2B, 0x08, 0xD9]),
                    // movs r0, #1; pop {r3, pc}
                    Edit::replace(&[0x01, 0x20, 0x08, 0xBD]),
                )
                .all(),
            ],
        )
        .when_marked(VENDOR_MARKERS),
        // 0xC0020004 / 0xC0020005
        PatchTarget::new(
            "hash_binding",
            vec![Candidate::new(
                Pattern::exact(&[0x01, 0x23, 0x03, 0x60, 0x00, 0x20, 0x70, 0x47, 0x70, 0xB5]),
                Edit::replace(&[0x00]),
            )],
        ),
        PatchTarget::new(
            "boot_to_hash_check",
            vec![
                Candidate::new(Pattern::exact(&le(0xC007_0004)), Edit::replace(&[0; 4])),
                Candidate::new(
                    Pattern::exact(&[0x4F, 0xF0, 0x04, 0x09, 0xCC, 0xF2, 0x07, 0x09]),
                    Edit::replace(&[0x4F, 0xF0, 0x00, 0x09, 0x4F, 0xF0, 0x00, 0x09]),
                ),
                Candidate::new(
                    Pattern::exact(&[
                        0x4F, 0xF0, 0x04, 0x09, 0x32, 0x46, 0x01, 0x98, 0x03, 0x99, 0xCC, 0xF2,
                        0x07, 0x09,
                    ]),
                    Edit::replace(&[
                        0x4F, 0xF0, 0x00, 0x09, 0x32, 0x46, 0x01, 0x98, 0x03, 0x99, 0x4F, 0xF0,
                        0x00, 0x09,
                    ]),
                ),
            ],
        ),
        PatchTarget::new(
            "security_check",
            vec![Candidate::new(
                Pattern::exact(&[0x01, 0x23, 0x03, 0x60, 0x00, 0x20, 0x70, 0x47, 0x70, 0xB5]),
                // movs r3, #0
                Edit::replace(&[0x00, 0x23]),
            )],
        ),
        PatchTarget::new(
            "anti_rollback",
            vec![Candidate::new(Pattern::exact(&le(0xC002_0053)), Edit::replace(&[0; 4]))],
        ),
        PatchTarget::new(
            "sbc",
            vec![Candidate::new(
                Pattern::exact(&[0x02, 0x4B, 0x18, 0x68, 0xC0, 0xF3, 0x40, 0x00, 0x70, 0x47]),
                // mov.w r0, #0
                Edit::replace_at(4, &[0x4F, 0xF0, 0x00, 0x00]),
            )],
        ),
        PatchTarget::new(
            "register_read_write",
            vec![Candidate::new(Pattern::exact(&le(0xC004_000D)), Edit::replace(&[0; 4]))],
        ),
        PatchTarget::new(
            "write_not_allowed",
            vec![
                Candidate::new(
                    Pattern::exact(&[0x37, 0xB5, 0x00, 0x23, 0x04, 0x46, 0x02, 0xA8]),
                    Edit::replace(&[0x37, 0xB5, 0x00, 0x20, 0x03, 0xB0, 0x30, 0xBD]),
                )
                .all(),
                Candidate::new(
                    Pattern::exact(&[0x0C, 0x23, 0xCC, 0xF2, 0x02, 0x03]),
                    Edit::replace(&[0x00, 0x23, 0x00, 0x23, 0x00, 0x23]),
                )
                .all()
                .with_companion(
                    Pattern::exact(&[0x2A, 0x23, 0xCC, 0xF2, 0x02, 0x03]),
                    Edit::replace(&[0x00, 0x23, 0x00, 0x23, 0x00, 0x23]),
                ),
            ],
        ),
    ];

    PatchTable {
        targets,
        load_address,
    }
}

/// Neutralise the first-stage version check.
pub fn patch_first_stage(image: &[u8]) -> (Vec<u8>, PatchReport) {
    apply_patches(image, &first_stage_table(0))
}

/// Neutralise the second-stage security checks. `load_address` resolves
/// in-image pointers.
pub fn patch_second_stage(image: &[u8], load_address: u32) -> (Vec<u8>, PatchReport) {
    apply_patches(image, &second_stage_table(load_address))
}
