use relay_proxy_engine::detect::media::{
    corrected, extension_for, fallback_name, from_extension, normalize_name, resolve,
    should_correct, sniff, GENERIC_MEDIA_TYPE,
};

#[test]
fn test_sniff_magic_numbers() {
    assert_eq!(sniff(b"%PDF-1.7\n"), Some("application/pdf"));
    assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0"), Some("image/png"));
    assert_eq!(sniff(b"\xff\xd8\xff\xe0\0\x10JFIF"), Some("image/jpeg"));
    assert_eq!(sniff(b"GIF89a\x01\0"), Some("image/gif"));
    assert_eq!(sniff(b"PK\x03\x04\x14\0"), Some("application/zip"));
    assert_eq!(sniff(b"ID3\x04\0\0"), Some("audio/mpeg"));
}

#[test]
fn test_sniff_riff_containers() {
    let mut header = vec![0u8; 16];
    header[0..4].copy_from_slice(b"RIFF");
    header[8..12].copy_from_slice(b"WEBP");
    assert_eq!(sniff(&header), Some("image/webp"));

    header[8..12].copy_from_slice(b"WAVE");
    assert_eq!(sniff(&header), Some("audio/wav"));
}

#[test]
fn test_sniff_iso_bmff() {
    // bytes 4..8 = "ftyp", 8..12 = brand
    let mut header = vec![0u8; 32];
    header[0..4].copy_from_slice(&24u32.to_be_bytes());
    header[4..8].copy_from_slice(b"ftyp");
    header[8..12].copy_from_slice(b"isom");
    assert_eq!(sniff(&header), Some("video/mp4"));

    header[8..12].copy_from_slice(b"qt  ");
    assert_eq!(sniff(&header), Some("video/quicktime"));
}

#[test]
fn test_sniff_text_and_binary() {
    assert_eq!(sniff(b"plain words, nothing else\n"), Some("text/plain"));
    assert_eq!(sniff("naïve résumé".as_bytes()), Some("text/plain"));
    assert_eq!(sniff(&[0u8, 1, 2, 3, 0xfe, 0xff, 0x80, 0x81]), None);
    assert_eq!(sniff(b""), None);
}

#[test]
fn test_extension_lookup() {
    assert_eq!(from_extension("Report.PDF"), Some("application/pdf"));
    assert_eq!(from_extension("dir.v2/notes"), None);
    assert_eq!(from_extension(".bashrc"), None);
    assert_eq!(extension_for("image/jpeg"), ".jpg");
    assert_eq!(extension_for("application/x-unknown"), ".bin");
}

#[test]
fn test_correction_rules() {
    assert!(should_correct(GENERIC_MEDIA_TYPE, None));
    assert!(should_correct("", Some("a.txt")));
    assert!(should_correct("text/plain", Some("photo.JPG")));
    assert!(!should_correct("text/plain", Some("notes.txt")));
    assert!(!should_correct("image/png", Some("photo.jpg")));
}

#[test]
fn test_resolve_prefers_declared_then_magic_then_name() {
    assert_eq!(resolve(Some("image/png"), None, b"%PDF-"), "image/png");
    assert_eq!(
        resolve(Some(GENERIC_MEDIA_TYPE), Some("a.bin"), b"%PDF-"),
        "application/pdf"
    );
    assert_eq!(
        resolve(None, Some("song.flac"), &[0u8, 0xff, 0x80, 0x81]),
        "audio/flac"
    );
    assert_eq!(resolve(None, None, &[0u8, 0xff, 0x80, 0x81]), GENERIC_MEDIA_TYPE);
}

#[test]
fn test_outgoing_media_type_correction() {
    assert_eq!(
        corrected(Some(GENERIC_MEDIA_TYPE), "application/pdf", Some("a.pdf")),
        Some("application/pdf".to_string())
    );
    assert_eq!(corrected(None, "image/png", None), Some("image/png".to_string()));
    assert_eq!(corrected(Some("image/png"), "image/png", None), None);
    assert_eq!(corrected(Some("image/gif"), "image/png", None), None);
    assert_eq!(corrected(None, GENERIC_MEDIA_TYPE, None), None);
}

#[test]
fn test_names() {
    let fp = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    assert_eq!(fallback_name(fp, "image/png"), "file_01234567.png");
    assert_eq!(fallback_name(fp, "application/ogg"), "file_01234567.ogg");
    assert_eq!(normalize_name(Some("C:\\tmp\\scan.pdf")), Some("scan.pdf".to_string()));
    assert_eq!(normalize_name(Some("dir/")), None);
    assert_eq!(normalize_name(None), None);
}
