pub mod attempt;
pub mod check_in;
pub mod contact;
pub mod journey;
pub mod notification_task;
pub mod quota;
pub mod user;

pub use attempt::ContactAttemptRepository;
pub use check_in::DailyCheckInRepository;
pub use contact::EmergencyContactRepository;
pub use journey::JourneyRepository;
pub use notification_task::NotificationTaskRepository;
pub use quota::SmsQuotaRepository;
pub use user::UserRepository;
