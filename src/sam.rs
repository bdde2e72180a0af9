//! SAM text emission for the aligner: match strings, CIGAR translation,
//! mapping quality and record formatting.

use crate::align::AlignmentHit;

/// Reverse-strand flag bit.
pub const FLAG_REVERSE: u16 = 0x10;
/// Secondary-alignment flag bit.
pub const FLAG_SECONDARY: u16 = 0x100;
/// Unmapped flag bit.
pub const FLAG_UNMAPPED: u16 = 0x4;

/// Byte-level alignment description: `m` match, `S` substitution, `C` clip.
pub fn match_string(query: &[u8], reference: &[u8], start: i64) -> Vec<u8> {
    let rlen = reference.len() as i64;
    query.iter()
        .enumerate()
        .map(|(i, &q)| {
            let r = start + i as i64;
            if r < 0 || r >= rlen {
                b'C'
            } else if q == reference[r as usize] && matches!(q, b'A' | b'C' | b'G' | b'T') {
                b'm'
            } else {
                b'S'
            }
        })
        .collect()
}

/// Translate a match string into CIGAR text. Terminal `C` runs become soft
/// clips; everything else (matches and substitutions) merges into `M` runs.
/// No indels can occur on a diagonal.
pub fn cigar_from_match(match_str: &[u8]) -> String {
    if match_str.is_empty() {
        return "*".to_string();
    }

    let mut out = String::new();
    let mut run_op = 0u8;
    let mut run_len = 0usize;

    for &m in match_str {
        let op = if m == b'C' { b'S' } else { b'M' };
        if op == run_op {
            run_len += 1;
        } else {
            if run_len > 0 {
                out.push_str(&run_len.to_string());
                out.push(run_op as char);
            }
            run_op = op;
            run_len = 1;
        }
    }
    out.push_str(&run_len.to_string());
    out.push(run_op as char);

    out
}

/// Mapping quality: `clamp(floor(40 * (len/2 - subs) / (len/2)), 0, 40)`.
pub fn mapq(len: usize, subs: u32) -> u8 {
    if len == 0 {
        return 0;
    }
    let half = len as f64 / 2.0;
    let q = (40.0 * (half - subs as f64) / half).floor();
    q.max(0.0).min(40.0) as u8
}

/// Assemble one SAM text line (no trailing newline).
#[allow(clippy::too_many_arguments)]
pub fn format_record(qname: &str,
                     flag: u16,
                     rname: &str,
                     pos_1based: i64,
                     mapq: u8,
                     cigar: &str,
                     seq: &[u8],
                     qual: Option<&[u8]>,
                     subs: u32)
                     -> String {
    let seq_text = if seq.is_empty() {
        "*".to_string()
    } else {
        String::from_utf8_lossy(seq).into_owned()
    };
    let qual_text = match qual {
        Some(q) if !q.is_empty() => String::from_utf8_lossy(q).into_owned(),
        _ => "*".to_string(),
    };

    let fields: Vec<String> = vec![
        qname.to_string(),
        flag.to_string(),
        rname.to_string(),
        pos_1based.to_string(),
        mapq.to_string(),
        cigar.to_string(),
        "*".to_string(),
        "0".to_string(),
        "0".to_string(),
        seq_text,
        qual_text,
        format!("NM:i:{}", subs),
    ];
    fields.join("\t")
}

/// Format a SAM record for one accepted hit against a named reference. The
/// substitution count is taken from the match string so NM always agrees
/// with a recount against this reference, fused-mode translation included.
pub fn record_for_hit(qname: &str,
                      hit: &AlignmentHit,
                      strand_reverse: bool,
                      primary: bool,
                      rname: &str,
                      seq: &[u8],
                      qual: Option<&[u8]>,
                      reference: &[u8])
                      -> String {
    let ms = match_string(seq, reference, hit.start);
    let cigar = cigar_from_match(&ms);
    let subs = ms.iter().filter(|&&m| m == b'S').count() as u32;

    let mut flag = 0u16;
    if strand_reverse {
        flag |= FLAG_REVERSE;
    }
    if !primary {
        flag |= FLAG_SECONDARY;
    }

    let pos = hit.start.max(0) + 1;
    format_record(qname,
                  flag,
                  rname,
                  pos,
                  mapq(seq.len(), subs),
                  &cigar,
                  seq,
                  qual,
                  subs)
}

/// One `@SQ` sidecar line.
pub fn sq_header_line(name: &str, len: usize) -> String {
    format!("@SQ\tSN:{}\tLN:{}", name, len)
}

#[cfg(test)]
mod test {
    use crate::align::AlignmentHit;
    use super::*;

    #[test]
    fn match_string_classifies() {
        let r = b"ACGTACGT";
        assert_eq!(b"mmmm".to_vec(), match_string(b"ACGT", r, 0));
        assert_eq!(b"mSmm".to_vec(), match_string(b"AGGT", r, 0));
        // N in the query is a substitution even when the reference agrees
        assert_eq!(b"mSmm".to_vec(), match_string(b"ANGT", r, 0));
    }

    #[test]
    fn match_string_clips_out_of_bounds() {
        let r = b"CCGGGGGTTT";
        let q = b"AAACCGGGGG";
        assert_eq!(b"CCCmmmmmmm".to_vec(), match_string(q, r, -3));

        let tail = match_string(b"GTTTAA", r, 6);
        assert_eq!(b"mmmmCC".to_vec(), tail);
    }

    #[test]
    fn cigar_merges_matches_and_subs() {
        assert_eq!("4M", cigar_from_match(b"mmmm"));
        assert_eq!("4M", cigar_from_match(b"mSSm"));
        assert_eq!("3S7M", cigar_from_match(b"CCCmmmmmmm"));
        assert_eq!("2M3S", cigar_from_match(b"mSCCC"));
        assert_eq!("1S2M1S", cigar_from_match(b"CmmC"));
        assert_eq!("*", cigar_from_match(b""));
    }

    #[test]
    fn mapq_scales_with_substitutions() {
        assert_eq!(40, mapq(100, 0));
        assert_eq!(0, mapq(10, 5));
        assert_eq!(0, mapq(10, 9));
        // 12 bp, 1 sub: floor(40 * 5/6) = 33
        assert_eq!(33, mapq(12, 1));
        assert_eq!(0, mapq(0, 0));
    }

    #[test]
    fn record_fields_are_tab_separated() {
        let line = format_record("r1", 16, "chr1", 100, 60, "10M",
                                 b"ACGTACGTAC", None, 2);
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(12, fields.len());
        assert_eq!("r1", fields[0]);
        assert_eq!("16", fields[1]);
        assert_eq!("chr1", fields[2]);
        assert_eq!("100", fields[3]);
        assert_eq!("10M", fields[5]);
        assert_eq!("*", fields[6]);
        assert_eq!("ACGTACGTAC", fields[9]);
        assert_eq!("*", fields[10]);
        assert_eq!("NM:i:2", fields[11]);
    }

    #[test]
    fn hit_record_happy_path() {
        let reference = b"ACGTACGTACGTACGTACGTACGTACGT";
        let query = b"ACGTACGTACGT";
        let hit = AlignmentHit { start: 4, subs: 0, clip_left: 0, clip_right: 0 };
        let line = record_for_hit("q", &hit, false, true, "ref", query, None, reference);
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!("0", fields[1]);
        assert_eq!("5", fields[3]);
        assert_eq!("12M", fields[5]);
        assert_eq!("NM:i:0", fields[11]);
    }

    #[test]
    fn clipped_hit_starts_at_position_one() {
        let reference = b"CCGGGGGTTT";
        let query = b"AAACCGGGGG";
        let hit = AlignmentHit { start: -3, subs: 0, clip_left: 3, clip_right: 0 };
        let line = record_for_hit("q", &hit, false, true, "ref", query, None, reference);
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!("1", fields[3]);
        assert!(fields[5].starts_with("3S"));
        assert_eq!("3S7M", fields[5]);
    }

    #[test]
    fn secondary_and_reverse_flags_compose() {
        let reference = b"ACGTACGT";
        let hit = AlignmentHit { start: 0, subs: 0, clip_left: 0, clip_right: 0 };
        let line = record_for_hit("q", &hit, true, false, "ref", b"ACGT", None, reference);
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!((FLAG_REVERSE | FLAG_SECONDARY).to_string(), fields[1]);
    }

    #[test]
    fn sq_line_shape() {
        assert_eq!("@SQ\tSN:chr1\tLN:248956422", sq_header_line("chr1", 248956422));
    }
}
