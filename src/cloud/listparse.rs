//! FTP directory listing parser
//!
//! Interprets one line of `LIST` output as produced by UNIX-style servers
//! (including NetWare, NetPresenz and symlinks), EPLF servers, VMS servers and
//! MS-DOS style servers. `ListingParser` splits a streamed listing into lines
//! and turns each recognised line into a collection entry.

use crate::cloud::{CollectionEntry, CollectionEntryKind, remove_extra_slashes};

/// Facts extracted from one listing line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListLine {
    pub name: String,
    /// CWD into the name might succeed
    pub try_cwd: bool,
    /// RETR of the name might succeed
    pub try_retr: bool,
    /// Size in bytes, when the server reported a binary size
    pub size: Option<u64>,
}

impl ListLine {
    pub fn is_dir(&self) -> bool {
        self.try_cwd && !self.try_retr
    }
}

const MONTHS: [&[u8; 3]; 12] = [
    b"jan", b"feb", b"mar", b"apr", b"may", b"jun", b"jul", b"aug", b"sep", b"oct", b"nov", b"dec",
];

fn get_month(token: &[u8]) -> Option<usize> {
    if token.len() != 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.iter().zip(token).all(|(a, b)| *a == b.to_ascii_lowercase()))
}

/// Decimal value of `digits`; no validation, wraps on overflow
fn get_long(digits: &[u8]) -> i64 {
    digits.iter().fold(0i64, |acc, c| {
        acc.wrapping_mul(10)
            .wrapping_add(i64::from(*c) - i64::from(b'0'))
    })
}

fn binary_size(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

/// Advance `i` while `pred` holds; `None` if the line ends first
fn skip(buf: &[u8], mut i: usize, pred: impl Fn(u8) -> bool) -> Option<usize> {
    if i >= buf.len() {
        return None;
    }
    while pred(buf[i]) {
        i += 1;
        if i == buf.len() {
            return None;
        }
    }
    Some(i)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse one listing line without its line terminator
///
/// # Returns
/// * `None` if the line is not in a recognised format
pub fn parse_list_line(buf: &[u8]) -> Option<ListLine> {
    if buf.len() < 2 {
        return None;
    }
    match buf[0] {
        b'+' => parse_eplf(buf),
        b'b' | b'c' | b'd' | b'l' | b'p' | b's' | b'-' => parse_unix(buf),
        _ => {
            if let Some(semi) = buf.iter().position(|c| *c == b';') {
                parse_vms(buf, semi)
            } else if buf[0].is_ascii_digit() {
                parse_msdos(buf)
            } else {
                None
            }
        }
    }
}

/// `+i8388621.48594,m825718503,r,s280,\tdjb.html`
fn parse_eplf(buf: &[u8]) -> Option<ListLine> {
    let mut line = ListLine {
        name: String::new(),
        try_cwd: false,
        try_retr: false,
        size: None,
    };
    let mut i = 1;
    for j in 1..buf.len() {
        match buf[j] {
            b'\t' => {
                line.name = text(&buf[j + 1..]);
                return Some(line);
            }
            b',' => {
                match buf[i] {
                    b'/' => line.try_cwd = true,
                    b'r' => line.try_retr = true,
                    b's' => line.size = binary_size(get_long(&buf[i + 1..j])),
                    _ => {}
                }
                i = j + 1;
            }
            _ => {}
        }
    }
    None
}

/// `-rw-r--r--   1 root     other        531 Jan 29 03:26 README`
fn parse_unix(buf: &[u8]) -> Option<ListLine> {
    let len = buf.len();
    let kind = buf[0];
    let try_cwd = kind == b'd' || kind == b'l';
    let try_retr = kind == b'-' || kind == b'l';

    let mut state = 1;
    let mut i = 0;
    let mut size = 0i64;
    let mut name_start = len;
    for j in 1..len {
        if buf[j] != b' ' || buf[j - 1] == b' ' {
            continue;
        }
        match state {
            1 => state = 2,
            2 => {
                state = 3;
                // NetPresenz puts "folder" where the link count goes
                if j - i == 6 && buf[i] == b'f' {
                    state = 4;
                }
            }
            3 => state = 4,
            4 => {
                size = get_long(&buf[i..j]);
                state = 5;
            }
            5 => {
                if get_month(&buf[i..j]).is_some() {
                    state = 6;
                } else {
                    size = get_long(&buf[i..j]);
                }
            }
            6 => state = 7,
            7 => {
                // "H:MM", "HH:MM" or a year
                if j - i < 4 {
                    return None;
                }
                name_start = j + 1;
                state = 8;
            }
            _ => {}
        }
        if state == 8 {
            break;
        }
        i = j + 1;
        while i < len && buf[i] == b' ' {
            i += 1;
        }
    }
    if state != 8 {
        return None;
    }

    let mut name = &buf[name_start.min(len)..];
    if kind == b'l' {
        if let Some(arrow) = name.windows(4).position(|w| w == b" -> ") {
            name = &name[..arrow];
        }
    }
    // NetWare indents names by three spaces
    if (buf[1] == b' ' || buf[1] == b'[') && name.len() > 3 && name.starts_with(b"   ") {
        name = &name[3..];
    }

    Some(ListLine {
        name: text(name),
        try_cwd,
        try_retr,
        size: binary_size(size),
    })
}

/// `CORE.DIR;1      1 8-SEP-1996 16:09 [SYSTEM] (RWE,RWE,RE,RE)`
fn parse_vms(buf: &[u8], semi: usize) -> Option<ListLine> {
    let mut name_len = semi;
    let mut try_cwd = false;
    if semi > 4 && &buf[semi - 4..semi] == b".DIR" {
        name_len -= 4;
        try_cwd = true;
    }
    let try_retr = !try_cwd;

    let mut i = skip(buf, semi, |c| c != b' ')?;
    i = skip(buf, i, |c| c == b' ')?;
    i = skip(buf, i, |c| c != b' ')?;
    i = skip(buf, i, |c| c == b' ')?;
    let mut j = skip(buf, i, |c| c != b'-')?;
    j = skip(buf, j, |c| c == b'-')?;
    i = j;
    j = skip(buf, j, |c| c != b'-')?;
    get_month(&buf[i..j])?;
    j = skip(buf, j, |c| c == b'-')?;
    j = skip(buf, j, |c| c != b' ')?;
    j = skip(buf, j, |c| c == b' ')?;
    j = skip(buf, j, |c| c != b':')?;
    j = skip(buf, j, |c| c == b':')?;
    skip(buf, j, |c| c != b':' && c != b' ')?;

    Some(ListLine {
        name: text(&buf[..name_len]),
        try_cwd,
        try_retr,
        size: None,
    })
}

/// `04-27-00  09:09PM       <DIR>          licensed`
fn parse_msdos(buf: &[u8]) -> Option<ListLine> {
    let len = buf.len();
    let mut j = skip(buf, 0, |c| c != b'-')?;
    j = skip(buf, j, |c| c == b'-')?;
    j = skip(buf, j, |c| c != b'-')?;
    j = skip(buf, j, |c| c == b'-')?;
    j = skip(buf, j, |c| c != b' ')?;
    j = skip(buf, j, |c| c == b' ')?;
    j = skip(buf, j, |c| c != b':')?;
    j = skip(buf, j, |c| c == b':')?;
    j = skip(buf, j, |c| c != b'A' && c != b'P')?;
    for marker in [b'A', b'P', b'M'] {
        if buf[j] == marker {
            j += 1;
            if j == len {
                return None;
            }
        }
    }
    j = skip(buf, j, |c| c == b' ')?;

    let mut line = ListLine {
        name: String::new(),
        try_cwd: false,
        try_retr: false,
        size: None,
    };
    if buf[j] == b'<' {
        line.try_cwd = true;
        j = skip(buf, j, |c| c != b' ')?;
    } else {
        let i = j;
        j = skip(buf, j, |c| c != b' ')?;
        line.size = binary_size(get_long(&buf[i..j]));
        line.try_retr = true;
    }
    j = skip(buf, j, |c| c == b' ')?;
    line.name = text(&buf[j..]);
    Some(line)
}

/// Accumulates a streamed `LIST` response into collection entries
#[derive(Debug)]
pub struct ListingParser {
    request_path: String,
    carry: Vec<u8>,
    entries: Vec<CollectionEntry>,
}

impl ListingParser {
    /// `request_path` is the listed collection relative to the client base
    pub fn new(request_path: impl Into<String>) -> Self {
        Self {
            request_path: request_path.into(),
            carry: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Feed the next chunk of listing data
    pub fn feed(&mut self, data: &[u8]) {
        let mut start = 0;
        for (i, c) in data.iter().enumerate() {
            if *c != b'\r' && *c != b'\n' {
                continue;
            }
            if self.carry.is_empty() {
                self.parse_line(&data[start..i]);
            } else {
                let mut line = std::mem::take(&mut self.carry);
                line.extend_from_slice(&data[start..i]);
                self.parse_line(&line);
            }
            start = i + 1;
        }
        self.carry.extend_from_slice(&data[start..]);
    }

    /// Parse any unterminated final line and return the entries
    pub fn finish(&mut self) -> Vec<CollectionEntry> {
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            self.parse_line(&line);
        }
        std::mem::take(&mut self.entries)
    }

    fn parse_line(&mut self, line: &[u8]) {
        let Some(parsed) = parse_list_line(line) else {
            return;
        };
        if parsed.name == "." || parsed.name == ".." {
            return;
        }
        let kind = if parsed.is_dir() {
            CollectionEntryKind::Collection
        } else {
            CollectionEntryKind::File
        };
        let path = remove_extra_slashes(&format!("{}/{}", self.request_path, parsed.name));
        self.entries.push(CollectionEntry::new(kind, path, parsed.size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_file() {
        let line = parse_list_line(b"-rw-r--r--   1 root     other        531 Jan 29 03:26 README").unwrap();
        assert_eq!(line.name, "README");
        assert!(line.try_retr);
        assert!(!line.try_cwd);
        assert_eq!(line.size, Some(531));
    }

    #[test]
    fn test_unix_dir_with_year() {
        let line = parse_list_line(b"dr-xr-xr-x   2 root     other        512 Apr  8  1994 etc").unwrap();
        assert_eq!(line.name, "etc");
        assert!(line.is_dir());
        assert_eq!(line.size, Some(512));
    }

    #[test]
    fn test_unix_symlink_is_both() {
        let line = parse_list_line(b"lrwxrwxrwx   1 root     other          7 Jan 25 00:17 bin -> usr/bin").unwrap();
        assert_eq!(line.name, "bin");
        assert!(line.try_cwd && line.try_retr);
        assert!(!line.is_dir());
    }

    #[test]
    fn test_unix_without_group() {
        let line = parse_list_line(b"-rw-r--r--   1 root  531 Jan 29 03:26 README").unwrap();
        assert_eq!(line.name, "README");
        assert_eq!(line.size, Some(531));
    }

    #[test]
    fn test_netpresenz_folder() {
        let line = parse_list_line(b"drwxrwxr-x               folder        2 May 10  1996 network").unwrap();
        assert_eq!(line.name, "network");
        assert!(line.is_dir());
    }

    #[test]
    fn test_netware_indent_stripped() {
        let line = parse_list_line(b"d [R----F--] supervisor            512       Jan 16 18:53    login").unwrap();
        assert_eq!(line.name, "login");
        assert!(line.is_dir());
    }

    #[test]
    fn test_name_keeps_spaces() {
        let line = parse_list_line(b"-rw-r--r--   1 root     other        10 Jan 29 03:26 my file.txt").unwrap();
        assert_eq!(line.name, "my file.txt");
    }

    #[test]
    fn test_short_time_token_rejected() {
        assert!(parse_list_line(b"-rw-r--r--   1 root     other        531 Jan 29 3:2 README").is_none());
    }

    #[test]
    fn test_eplf() {
        let line = parse_list_line(b"+i8388621.48594,m825718503,r,s280,\tdjb.html").unwrap();
        assert_eq!(line.name, "djb.html");
        assert!(line.try_retr);
        assert_eq!(line.size, Some(280));

        let dir = parse_list_line(b"+i8388621.50690,m824255907,/,\t514").unwrap();
        assert_eq!(dir.name, "514");
        assert!(dir.is_dir());
        assert_eq!(dir.size, None);

        assert!(parse_list_line(b"+i8388621.50690,m824255907,/,").is_none());
    }

    #[test]
    fn test_vms() {
        let dir = parse_list_line(b"CORE.DIR;1      1  8-SEP-1996 16:09 [SYSTEM] (RWE,RWE,RE,RE)").unwrap();
        assert_eq!(dir.name, "CORE");
        assert!(dir.is_dir());

        let file = parse_list_line(b"00README.TXT;1      2 30-DEC-1996 17:44 [SYSTEM] (RWED,RWED,RE,RE)").unwrap();
        assert_eq!(file.name, "00README.TXT");
        assert!(file.try_retr);
        assert_eq!(file.size, None);

        assert!(parse_list_line(b"BAD.TXT;1      2 30-XYZ-1996 17:44 [SYSTEM]").is_none());
    }

    #[test]
    fn test_msdos() {
        let dir = parse_list_line(b"04-27-00  09:09PM       <DIR>          licensed").unwrap();
        assert_eq!(dir.name, "licensed");
        assert!(dir.is_dir());

        let file = parse_list_line(b"04-14-00  03:47PM                  589 readme.htm").unwrap();
        assert_eq!(file.name, "readme.htm");
        assert_eq!(file.size, Some(589));
        assert!(file.try_retr);
    }

    #[test]
    fn test_unrecognised_lines() {
        assert!(parse_list_line(b"").is_none());
        assert!(parse_list_line(b"x").is_none());
        assert!(parse_list_line(b"total 12").is_none());
    }

    #[test]
    fn test_listing_parser_splits_chunks() {
        let mut parser = ListingParser::new("/docs/");
        parser.feed(b"total 2\r\ndrwxr-xr-x   2 root  root  4096 Jan 29 03:26 .\r\n-rw-r--r--   1 ro");
        parser.feed(b"ot     other        531 Jan 29 03:26 README\r\ndr-xr-xr-x   2 root     other   ");
        parser.feed(b"     512 Apr  8  1994 etc");
        let entries = parser.finish();
        assert_eq!(
            entries,
            vec![
                CollectionEntry::new(CollectionEntryKind::File, "/docs/README", Some(531)),
                CollectionEntry::new(CollectionEntryKind::Collection, "/docs/etc", Some(512)),
            ]
        );
    }
}
