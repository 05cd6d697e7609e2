use std::cmp::Ordering;
use std::str::FromStr;
use std::time::{
  Duration,
  Instant
};

use anyhow::anyhow;
use regex::RegexBuilder;
use tracing::trace;

use crate::datetime::parse_due_timestamp;
use crate::task::{
  Category,
  Status,
  Task
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default,
)]
pub enum CategoryFilter {
  #[default]
  All,
  Only(Category)
}

impl CategoryFilter {
  fn admits(
    self,
    category: Category
  ) -> bool {
    match self {
      | CategoryFilter::All => true,
      | CategoryFilter::Only(want) => {
        want == category
      }
    }
  }
}

impl FromStr for CategoryFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    if s.trim().eq_ignore_ascii_case("all")
    {
      return Ok(CategoryFilter::All);
    }
    Ok(CategoryFilter::Only(s.parse()?))
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default,
)]
pub enum DueOrder {
  #[default]
  None,
  Asc,
  Desc
}

impl FromStr for DueOrder {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str()
    {
      | "none" | "" => Ok(DueOrder::None),
      | "asc" | "ascending" => {
        Ok(DueOrder::Asc)
      }
      | "desc" | "descending" => {
        Ok(DueOrder::Desc)
      }
      | other => Err(anyhow!(
        "invalid sort order: {other}"
      ))
    }
  }
}

/// What the list and board show.
#[derive(
  Debug, Clone, PartialEq, Eq, Default,
)]
pub struct ViewCriteria {
  pub category:  CategoryFilter,
  pub due_order: DueOrder,
  pub search:    String
}

impl ViewCriteria {
  /// `category:<c>`, `sort:<o>`; every
  /// other word joins the search text.
  #[tracing::instrument(skip(terms))]
  pub fn from_terms(
    terms: &[String]
  ) -> anyhow::Result<Self> {
    let mut criteria = Self::default();
    let mut words = Vec::new();

    for term in terms {
      if let Some(value) =
        term.strip_prefix("category:")
      {
        criteria.category = value.parse()?;
      } else if let Some(value) =
        term.strip_prefix("sort:")
      {
        criteria.due_order = value.parse()?;
      } else {
        words.push(term.as_str());
      }
    }

    criteria.search = words.join(" ");
    trace!(?criteria, "parsed view criteria");
    Ok(criteria)
  }

  pub fn with_search(
    mut self,
    search: impl Into<String>
  ) -> Self {
    self.search = search.into();
    self
  }

  #[must_use]
  pub fn matches(
    &self,
    task: &Task
  ) -> bool {
    self.category.admits(task.category)
      && search_matches(&self.search, task)
  }

  /// Filtered and, when a due order is
  /// set, sorted. Otherwise the input
  /// order is kept.
  pub fn apply<'a>(
    &self,
    tasks: &'a [Task]
  ) -> Vec<&'a Task> {
    let mut visible: Vec<&Task> = tasks
      .iter()
      .filter(|task| self.matches(task))
      .collect();

    match self.due_order {
      | DueOrder::None => {}
      | DueOrder::Asc => {
        visible.sort_by(|a, b| {
          compare_due(a, b, false)
        })
      }
      | DueOrder::Desc => {
        visible.sort_by(|a, b| {
          compare_due(a, b, true)
        })
      }
    }

    visible
  }

  /// Buckets the visible tasks by status.
  /// Without a due order each bucket is
  /// ranked by `order`.
  pub fn partition<'a>(
    &self,
    tasks: &'a [Task]
  ) -> Partitions<'a> {
    let mut parts = Partitions::default();
    for task in self.apply(tasks) {
      parts.bucket_mut(task.status).push(task);
    }

    if self.due_order == DueOrder::None {
      for status in Status::ALL {
        parts
          .bucket_mut(status)
          .sort_by_key(|task| task.order);
      }
    }

    parts
  }
}

#[derive(Debug, Default)]
pub struct Partitions<'a> {
  todo:        Vec<&'a Task>,
  in_progress: Vec<&'a Task>,
  completed:   Vec<&'a Task>
}

impl<'a> Partitions<'a> {
  pub fn get(
    &self,
    status: Status
  ) -> &[&'a Task] {
    match status {
      | Status::Todo => &self.todo,
      | Status::InProgress => {
        &self.in_progress
      }
      | Status::Completed => &self.completed
    }
  }

  fn bucket_mut(
    &mut self,
    status: Status
  ) -> &mut Vec<&'a Task> {
    match status {
      | Status::Todo => &mut self.todo,
      | Status::InProgress => {
        &mut self.in_progress
      }
      | Status::Completed => {
        &mut self.completed
      }
    }
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (Status, &[&'a Task])>
  {
    Status::ALL.into_iter().map(
      move |status| {
        (status, self.get(status))
      }
    )
  }

  pub fn total(&self) -> usize {
    self.todo.len()
      + self.in_progress.len()
      + self.completed.len()
  }
}

fn search_matches(
  search: &str,
  task: &Task
) -> bool {
  let needle =
    search.trim().to_lowercase();
  if needle.is_empty() {
    return true;
  }

  [
    task.title.as_str(),
    task.category.as_str(),
    task.due_date.as_str()
  ]
  .iter()
  .any(|field| {
    field.to_lowercase().contains(&needle)
  })
}

// Unparsable dates go last in both
// directions.
fn compare_due(
  a: &Task,
  b: &Task,
  descending: bool
) -> Ordering {
  match (
    parse_due_timestamp(&a.due_date),
    parse_due_timestamp(&b.due_date)
  ) {
    | (Some(x), Some(y)) => {
      if descending {
        y.cmp(&x)
      } else {
        x.cmp(&y)
      }
    }
    | (Some(_), None) => Ordering::Less,
    | (None, Some(_)) => {
      Ordering::Greater
    }
    | (None, None) => Ordering::Equal
  }
}

/// Holds the latest value until it has
/// been quiet for `delay`.
#[derive(Debug)]
pub struct Debouncer<T> {
  delay:   Duration,
  pending: Option<(T, Instant)>
}

impl<T> Debouncer<T> {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      pending: None
    }
  }

  pub fn push(
    &mut self,
    value: T,
    now: Instant
  ) {
    self.pending =
      Some((value, now + self.delay));
  }

  pub fn deadline(
    &self
  ) -> Option<Instant> {
    self
      .pending
      .as_ref()
      .map(|(_, due)| *due)
  }

  pub fn poll(
    &mut self,
    now: Instant
  ) -> Option<T> {
    match self.deadline() {
      | Some(due) if now >= due => {
        self
          .pending
          .take()
          .map(|(value, _)| value)
      }
      | _ => None
    }
  }

  pub fn flush(&mut self) -> Option<T> {
    self
      .pending
      .take()
      .map(|(value, _)| value)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
  pub text:    String,
  pub matched: bool
}

/// Splits `text` around every
/// case-insensitive occurrence of
/// `query`, taken literally.
pub fn highlight(
  text: &str,
  query: &str
) -> Vec<Segment> {
  let plain = || {
    vec![Segment {
      text:    text.to_string(),
      matched: false
    }]
  };

  let query = query.trim();
  if query.is_empty() || text.is_empty() {
    return plain();
  }

  let Ok(re) = RegexBuilder::new(
    &regex::escape(query)
  )
  .case_insensitive(true)
  .build() else {
    return plain();
  };

  let mut out = Vec::new();
  let mut cursor = 0;
  for found in re.find_iter(text) {
    if found.start() > cursor {
      out.push(Segment {
        text:    text[cursor..found.start()]
          .to_string(),
        matched: false
      });
    }
    out.push(Segment {
      text:    found.as_str().to_string(),
      matched: true
    });
    cursor = found.end();
  }
  if cursor < text.len() {
    out.push(Segment {
      text:    text[cursor..].to_string(),
      matched: false
    });
  }

  out
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::task::{
    TaskDraft,
    TaskId
  };

  fn task(
    id: &str,
    title: &str,
    due: &str,
    status: Status,
    category: Category,
    order: i64
  ) -> Task {
    TaskDraft::new(title, due)
      .with_status(status)
      .with_category(category)
      .into_task(TaskId::new(id), order)
  }

  fn sample() -> Vec<Task> {
    vec![
      task(
        "a",
        "Write report",
        "2024-06-03T00:00:00.000Z",
        Status::Todo,
        Category::Work,
        2
      ),
      task(
        "b",
        "Buy milk",
        "2024-06-01T00:00:00.000Z",
        Status::Todo,
        Category::Personal,
        1
      ),
      task(
        "c",
        "Deploy",
        "not a date",
        Status::Completed,
        Category::Work,
        3
      ),
      task(
        "d",
        "Review PR",
        "2024-06-02T00:00:00.000Z",
        Status::InProgress,
        Category::Work,
        4
      ),
    ]
  }

  fn ids(tasks: &[&Task]) -> Vec<String> {
    tasks
      .iter()
      .map(|t| t.id.to_string())
      .collect()
  }

  #[test]
  fn parses_terms() {
    let terms: Vec<String> = [
      "category:personal",
      "sort:desc",
      "buy",
      "milk"
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let criteria =
      ViewCriteria::from_terms(&terms)
        .unwrap();
    assert_eq!(
      criteria.category,
      CategoryFilter::Only(
        Category::Personal
      )
    );
    assert_eq!(
      criteria.due_order,
      DueOrder::Desc
    );
    assert_eq!(criteria.search, "buy milk");

    assert!(
      ViewCriteria::from_terms(&[
        "sort:sideways".to_string()
      ])
      .is_err()
    );
  }

  #[test]
  fn search_is_case_insensitive() {
    let tasks = sample();
    let criteria = ViewCriteria::default()
      .with_search("REPORT");
    assert_eq!(
      ids(&criteria.apply(&tasks)),
      vec!["a"]
    );

    let by_category =
      ViewCriteria::default()
        .with_search("personal");
    assert_eq!(
      ids(&by_category.apply(&tasks)),
      vec!["b"]
    );

    let lower = ids(
      &ViewCriteria::default()
        .with_search("work")
        .apply(&tasks)
    );
    let upper = ids(
      &ViewCriteria::default()
        .with_search("WORK")
        .apply(&tasks)
    );
    assert_eq!(lower, upper);
    assert_eq!(lower, vec!["a", "c", "d"]);
  }

  #[test]
  fn search_uses_raw_due_date() {
    let tasks = vec![task(
      "x",
      "Plan",
      "2024-06-01T00:00:00.000Z",
      Status::Todo,
      Category::Work,
      1
    )];
    let hit = ViewCriteria::default()
      .with_search("2024-06");
    assert_eq!(hit.apply(&tasks).len(), 1);

    let miss = ViewCriteria::default()
      .with_search("01 Jun, 2024");
    assert!(miss.apply(&tasks).is_empty());
  }

  #[test]
  fn filtering_is_idempotent() {
    let tasks = sample();
    let criteria = ViewCriteria {
      category:  CategoryFilter::Only(
        Category::Work
      ),
      due_order: DueOrder::Asc,
      search:    "e".to_string()
    };

    let once: Vec<Task> = criteria
      .apply(&tasks)
      .into_iter()
      .cloned()
      .collect();
    let twice = criteria.apply(&once);
    assert_eq!(
      ids(&twice),
      ids(&criteria.apply(&tasks))
    );
  }

  #[test]
  fn due_order_puts_invalid_dates_last() {
    let tasks = sample();
    let asc = ViewCriteria {
      due_order: DueOrder::Asc,
      ..ViewCriteria::default()
    };
    assert_eq!(
      ids(&asc.apply(&tasks)),
      vec!["b", "d", "a", "c"]
    );

    let desc = ViewCriteria {
      due_order: DueOrder::Desc,
      ..ViewCriteria::default()
    };
    assert_eq!(
      ids(&desc.apply(&tasks)),
      vec!["a", "d", "b", "c"]
    );
  }

  #[test]
  fn partitions_rank_by_order_without_due_sort()
  {
    let tasks = sample();
    let parts = ViewCriteria::default()
      .partition(&tasks);
    assert_eq!(
      ids(parts.get(Status::Todo)),
      vec!["b", "a"]
    );
    assert_eq!(
      ids(parts.get(Status::InProgress)),
      vec!["d"]
    );
    assert_eq!(parts.total(), 4);

    let by_due = ViewCriteria {
      due_order: DueOrder::Desc,
      ..ViewCriteria::default()
    }
    .partition(&tasks);
    assert_eq!(
      ids(by_due.get(Status::Todo)),
      vec!["a", "b"]
    );
  }

  #[test]
  fn debouncer_waits_for_quiet() {
    let start = Instant::now();
    let delay = Duration::from_millis(300);
    let mut debouncer = Debouncer::new(delay);

    debouncer.push("r", start);
    debouncer.push(
      "re",
      start + Duration::from_millis(100)
    );
    assert_eq!(
      debouncer.poll(
        start + Duration::from_millis(350)
      ),
      None
    );
    assert_eq!(
      debouncer.poll(
        start + Duration::from_millis(400)
      ),
      Some("re")
    );
    assert_eq!(debouncer.deadline(), None);

    debouncer.push("rev", start);
    assert_eq!(debouncer.flush(), Some("rev"));
  }

  #[test]
  fn highlight_marks_literal_matches() {
    let segments =
      highlight("Fix a.b in A.B", "a.b");
    let rendered: Vec<(&str, bool)> =
      segments
        .iter()
        .map(|s| (s.text.as_str(), s.matched))
        .collect();
    assert_eq!(
      rendered,
      vec![
        ("Fix ", false),
        ("a.b", true),
        (" in ", false),
        ("A.B", true),
      ]
    );

    assert_eq!(
      highlight("plain", "").len(),
      1
    );
  }
}
