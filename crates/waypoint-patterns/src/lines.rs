/// Byte offsets of line starts, for mapping match offsets to line numbers.
pub(crate) struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub(crate) fn new(content: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));
        // A trailing newline does not open another line.
        if starts.len() > 1 && starts.last() == Some(&content.len()) {
            starts.pop();
        }
        Self {
            starts,
            len: content.len(),
        }
    }

    pub(crate) fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 0-based line containing byte `offset`.
    pub(crate) fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    pub(crate) fn line_start(&self, line: usize) -> usize {
        self.starts[line]
    }

    fn line_end(&self, line: usize) -> usize {
        self.starts.get(line + 1).copied().unwrap_or(self.len)
    }

    pub(crate) fn line_text<'a>(&self, content: &'a str, line: usize) -> &'a str {
        content[self.starts[line]..self.line_end(line)].trim_end_matches(['\n', '\r'])
    }

    /// The full text of lines `first..=last`.
    pub(crate) fn span_lines<'a>(&self, content: &'a str, first: usize, last: usize) -> &'a str {
        content[self.starts[first]..self.line_end(last)].trim_end_matches(['\n', '\r'])
    }

    pub(crate) fn context(
        &self,
        content: &str,
        first: usize,
        last: usize,
        window: usize,
    ) -> Vec<String> {
        if window == 0 {
            return Vec::new();
        }
        let from = first.saturating_sub(window);
        let to = (last + window).min(self.line_count() - 1);
        (from..=to)
            .map(|l| self.line_text(content, l).to_string())
            .collect()
    }
}
