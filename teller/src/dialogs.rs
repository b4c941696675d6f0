//! Declarative vocabulary of the legacy client.
//!
//! The state machine refers to windows and controls only through
//! [`DialogRole`] and [`ControlRole`]. Concrete titles and control names live
//! here, with built-in defaults that configuration may override entry by
//! entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::driver::WindowMatcher;

/// Logical role of a top-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogRole {
    /// Prompt shown by the loader before the client starts
    LoaderPrompt,
    Login,
    /// Generic error window carrying a message in a text field
    Error,
    /// Notice shown after login when the password has expired
    PasswordExpired,
    ChangePassword,
    ModeSelect,
    ReportSelect,
    /// Message box whose content can be copied to the clipboard
    SystemMessage,
    /// Main frame; hosts the status strip echoing the hovered control
    MainFrame,
    Filter,
    ContractList,
    ExportFile,
    Sort,
    ReportFile,
    ReportParams,
}

impl DialogRole {
    pub fn default_matcher(self) -> WindowMatcher {
        match self {
            DialogRole::LoaderPrompt => WindowMatcher::exact("Dialog"),
            DialogRole::Login => WindowMatcher::exact("Вход в систему"),
            DialogRole::Error => WindowMatcher::exact("Произошла ошибка"),
            DialogRole::PasswordExpired => WindowMatcher::exact("Внимание"),
            DialogRole::ChangePassword => WindowMatcher::pattern("Смена пароля.+"),
            DialogRole::ModeSelect => WindowMatcher::exact("Выбор режима"),
            DialogRole::ReportSelect => WindowMatcher::exact("Выбор отчета"),
            DialogRole::SystemMessage => WindowMatcher::exact("Colvir Banking System"),
            DialogRole::MainFrame => WindowMatcher::pattern("Банковская система.+"),
            DialogRole::Filter => WindowMatcher::exact("Фильтр"),
            DialogRole::ContractList => WindowMatcher::exact("Кредитные договора"),
            DialogRole::ExportFile => WindowMatcher::exact("Выберите файл для экспорта"),
            DialogRole::Sort => WindowMatcher::exact("Сортировка"),
            DialogRole::ReportFile => WindowMatcher::exact("Файл отчета "),
            DialogRole::ReportParams => WindowMatcher::exact("Параметры отчета "),
        }
    }
}

/// Logical role of a control, menu path, toolbar label or key sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRole {
    Confirm,
    LoginUser,
    LoginPassword,
    ErrorText,
    NewPassword,
    ConfirmPassword,
    ModeInput,
    /// Key sequence that submits a text field
    SubmitKeys,
    StatusStrip,
    ExportPath,
    ExportSave,
    ContractsExportMenu,
    Toolbar,
    /// Status strip hint of the toolbar button that opens report selection
    GetReportHint,
    Preview,
    ExportToFile,
    ReportFolder,
    ReportName,
    ReportFormat,
    PeriodFrom,
    PeriodTo,
}

impl ControlRole {
    pub fn default_name(self) -> &'static str {
        match self {
            ControlRole::Confirm => "OK",
            ControlRole::LoginUser => "Edit2",
            ControlRole::LoginPassword => "Edit",
            ControlRole::ErrorText => "Edit",
            ControlRole::NewPassword => "Edit2",
            ControlRole::ConfirmPassword => "Edit0",
            ControlRole::ModeInput => "Edit2",
            ControlRole::SubmitKeys => "~",
            ControlRole::StatusStrip => "StatusBar",
            ControlRole::ExportPath => "Edit4",
            ControlRole::ExportSave => "&Save",
            ControlRole::ContractsExportMenu => "#4->#4->#1",
            ControlRole::Toolbar => "Static0",
            ControlRole::GetReportHint => "Получить отчет(F5)",
            ControlRole::Preview => "Предварительный просмотр",
            ControlRole::ExportToFile => "Экспорт в файл...",
            ControlRole::ReportFolder => "Edit2",
            ControlRole::ReportName => "Edit4",
            ControlRole::ReportFormat => "ComboBox",
            ControlRole::PeriodFrom => "Edit2",
            ControlRole::PeriodTo => "Edit4",
        }
    }
}

/// Role table with per-entry overrides over the built-in vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogTable {
    windows: HashMap<DialogRole, WindowMatcher>,
    controls: HashMap<ControlRole, String>,
}

impl DialogTable {
    pub fn window(&self, role: DialogRole) -> WindowMatcher {
        self.windows
            .get(&role)
            .cloned()
            .unwrap_or_else(|| role.default_matcher())
    }

    pub fn control(&self, role: ControlRole) -> &str {
        self.controls
            .get(&role)
            .map(String::as_str)
            .unwrap_or_else(|| role.default_name())
    }

    pub fn with_window(mut self, role: DialogRole, matcher: WindowMatcher) -> Self {
        self.windows.insert(role, matcher);
        self
    }

    pub fn with_control(mut self, role: ControlRole, name: impl Into<String>) -> Self {
        self.controls.insert(role, name.into());
        self
    }
}
